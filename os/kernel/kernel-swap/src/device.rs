//! The block-device seam used for swap transfers.

use kernel_info::memory::SECTOR_SIZE;

/// One sector worth of bytes.
pub type Sector = [u8; SECTOR_SIZE];

/// Synchronous sector I/O on the swap device.
///
/// Errors are the driver's business; at this layer a transfer always
/// completes.
pub trait SectorDevice {
    fn read_sector(&self, sector: u32, buf: &mut Sector);
    fn write_sector(&self, sector: u32, buf: &Sector);
}

impl<D: SectorDevice + ?Sized> SectorDevice for &D {
    #[inline]
    fn read_sector(&self, sector: u32, buf: &mut Sector) {
        (**self).read_sector(sector, buf);
    }

    #[inline]
    fn write_sector(&self, sector: u32, buf: &Sector) {
        (**self).write_sector(sector, buf);
    }
}
