use super::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_vm_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Lower-level interface to block device drivers.
///
/// Transfers are always exactly one sector. Implementations block the calling
/// thread until the device has completed the transfer.
pub trait BlockDevice: Send {
    /// Reads sector `sector` into `buf`, which must be `BLOCK_SECTOR_SIZE`
    /// bytes long.
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf`, which must be `BLOCK_SECTOR_SIZE` bytes long, to sector
    /// `sector`.
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;

    /// The size of the device in sectors.
    fn size(&self) -> BlockSector;
}

/// Verifies that `sector` is a valid offset within a device of `size` sectors
/// and that `buf` holds exactly one sector.
pub fn check_transfer(size: BlockSector, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
    if sector >= size {
        return Err(BlockError::SectorOutOfBounds);
    }
    if buf.len() != BLOCK_SECTOR_SIZE {
        return Err(BlockError::BufferInvalid);
    }
    Ok(())
}

/// A block device backed by kernel memory.
///
/// Stands in for the swap partition when no disk is attached, and is what
/// the host-side tests swap to.
pub struct RamDisk {
    data: Vec<u8>,
    read_count: u32,
    write_count: u32,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
            read_count: 0,
            write_count: 0,
        }
    }

    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    fn sector_range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockDevice for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        check_transfer(self.size(), sector, buf)?;
        buf.copy_from_slice(&self.data[Self::sector_range(sector)]);
        self.read_count += 1;
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        check_transfer(self.size(), sector, buf)?;
        self.data[Self::sector_range(sector)].copy_from_slice(buf);
        self.write_count += 1;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size(&self) -> BlockSector {
        (self.data.len() / BLOCK_SECTOR_SIZE) as BlockSector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let mut disk = RamDisk::new(4);
        let sector = [0xabu8; BLOCK_SECTOR_SIZE];
        disk.write(3, &sector).unwrap();

        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        disk.read(3, &mut buf).unwrap();
        assert_eq!(buf, sector);
        disk.read(2, &mut buf).unwrap();
        assert_eq!(buf, [0u8; BLOCK_SECTOR_SIZE]);
        assert_eq!(disk.read_count(), 2);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn ram_disk_rejects_bad_transfers() {
        let mut disk = RamDisk::new(2);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert_eq!(disk.read(2, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(disk.write(0, &buf[..10]), Err(BlockError::BufferInvalid));
        assert_eq!(disk.size(), 2);
    }
}
