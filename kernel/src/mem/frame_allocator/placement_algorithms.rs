//! Frame placement policies for the user pool.

use super::CoreMapEntry;

/// A placement algorithm for picking the next free frame.
pub trait PlacementAlgorithm: Default {
    /// Returns the frame number of a free frame, or `None` if every frame in
    /// `core_map` is allocated.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        // Search from the last position to the end, then wrap around once.
        let start = self.position % total_frames;
        let found = (start..total_frames)
            .chain(0..start)
            .find(|&i| !core_map[i].allocated())?;

        self.position = (found + 1) % total_frames;
        Some(found)
    }
}
