use crate::mem::FrameId;
use alloc::collections::VecDeque;

pub trait PageReplacementPolicy {
    /// Removes and returns a victim from `frames`, which is ordered oldest
    /// first. `referenced` reports (and clears) a frame's accessed bit.
    ///
    /// Returns `None` when every frame was referenced; `frames` keeps all of
    /// them in that case.
    fn select_victim<F>(&mut self, frames: &mut VecDeque<FrameId>, referenced: F) -> Option<FrameId>
    where
        F: FnMut(FrameId) -> bool;
}

/// The clock algorithm: a referenced frame has its bit cleared and moves to
/// the back of the list instead of being evicted.
#[derive(Default)]
pub struct SecondChance;

impl PageReplacementPolicy for SecondChance {
    fn select_victim<F>(&mut self, frames: &mut VecDeque<FrameId>, mut referenced: F) -> Option<FrameId>
    where
        F: FnMut(FrameId) -> bool,
    {
        // One sweep. A full rotation leaves the original head back at the front.
        for _ in 0..frames.len() {
            let frame = frames.pop_front()?;
            if !referenced(frame) {
                return Some(frame);
            }
            frames.push_back(frame);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn frames(ids: &[usize]) -> VecDeque<FrameId> {
        ids.iter().map(|&i| FrameId(i)).collect()
    }

    #[test]
    fn skips_referenced_frames() {
        let mut clock = frames(&[0, 1, 2]);
        let mut bits = [true, true, false];
        let victim = SecondChance.select_victim(&mut clock, |f| core::mem::take(&mut bits[f.0]));
        assert_eq!(victim, Some(FrameId(2)));
        assert_eq!(bits, [false, false, false]);
        // Spared frames moved to the back in their original order.
        assert_eq!(clock.iter().map(|f| f.0).collect::<Vec<_>>(), [0, 1]);
    }

    #[test]
    fn all_referenced_keeps_order() {
        let mut clock = frames(&[4, 5, 6]);
        let victim = SecondChance.select_victim(&mut clock, |_| true);
        assert_eq!(victim, None);
        assert_eq!(clock.front(), Some(&FrameId(4)));
        assert_eq!(clock.len(), 3);
    }

    #[test]
    fn empty_list() {
        let mut clock = VecDeque::new();
        assert_eq!(SecondChance.select_victim(&mut clock, |_| false), None);
    }
}
