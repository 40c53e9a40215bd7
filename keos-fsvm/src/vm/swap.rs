//! The swap area: a second block device divided into page-sized slots,
//! with a bitmap tracking which are occupied.

use alloc::{sync::Arc, vec::Vec};
use keos::{
    KernelError,
    addressing::Pa,
    block::{BlockDevice, Sector},
    config::{PAGE_SIZE, SECTOR_SIZE},
    mm::FrameAllocator,
    sync::SpinLock,
};

const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// A page-granularity swap area over a dedicated [`BlockDevice`].
pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    bitmap: SpinLock<Vec<bool>>,
}

impl SwapArea {
    /// Sizes the swap area to `device`'s capacity, one slot per
    /// [`PAGE_SIZE`] worth of sectors.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.num_sectors() / SECTORS_PER_PAGE;
        SwapArea {
            device,
            bitmap: SpinLock::new(alloc::vec![false; slots]),
        }
    }

    /// Writes the contents of frame `pa` to a freshly allocated slot,
    /// returning its id.
    ///
    /// # Errors
    /// Returns [`KernelError::NoSpace`] if the swap area is full.
    pub fn swap_out(&self, frames: &dyn FrameAllocator, pa: Pa) -> Result<usize, KernelError> {
        let mut bitmap = self.bitmap.lock();
        let slot = match bitmap.iter().position(|&used| !used) {
            Some(s) => s,
            None => {
                bitmap.unlock();
                return Err(KernelError::NoSpace);
            }
        };
        bitmap[slot] = true;
        bitmap.unlock();

        let base = slot * SECTORS_PER_PAGE;
        let device = self.device.clone();
        frames.with_frame(pa, &mut |buf| -> Result<(), KernelError> {
            for i in 0..SECTORS_PER_PAGE {
                let chunk: &[u8; SECTOR_SIZE] =
                    (&buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]).try_into().unwrap();
                device.write_sector(Sector(base + i), chunk)?;
            }
            Ok(())
        })?;
        Ok(slot)
    }

    /// Reads slot `slot` back into frame `pa` and releases the slot.
    pub fn swap_in(&self, frames: &dyn FrameAllocator, slot: usize, pa: Pa) -> Result<(), KernelError> {
        let base = slot * SECTORS_PER_PAGE;
        let device = self.device.clone();
        frames.with_frame(pa, &mut |buf| -> Result<(), KernelError> {
            for i in 0..SECTORS_PER_PAGE {
                let chunk: &mut [u8; SECTOR_SIZE] =
                    (&mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]).try_into().unwrap();
                device.read_sector(Sector(base + i), chunk)?;
            }
            Ok(())
        })?;
        self.free_slot(slot);
        Ok(())
    }

    /// Releases `slot` without reading it back, for a process teardown that
    /// discards anonymous pages instead of restoring them.
    pub fn free_slot(&self, slot: usize) {
        let mut bitmap = self.bitmap.lock();
        bitmap[slot] = false;
        bitmap.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos::block::MemBlockDevice;
    use keos::mm::test_doubles::BitmapFrameAllocator;

    #[test]
    fn swap_out_then_in_restores_contents_byte_for_byte() {
        let device = Arc::new(MemBlockDevice::new(SECTORS_PER_PAGE * 4));
        let swap = SwapArea::new(device);
        let frames = BitmapFrameAllocator::new(2);
        let pa = frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        frames.with_frame(pa, &mut |buf| {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 256) as u8;
            }
        });
        let slot = swap.swap_out(&frames, pa).unwrap();

        let pa2 = frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        swap.swap_in(&frames, slot, pa2).unwrap();
        let mut restored = [0u8; PAGE_SIZE];
        frames.with_frame(pa2, &mut |buf| restored.copy_from_slice(buf));
        let mut expected = [0u8; PAGE_SIZE];
        for (i, b) in expected.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        assert_eq!(restored, expected);
    }

    #[test]
    fn exhausted_swap_area_reports_no_space() {
        let device = Arc::new(MemBlockDevice::new(SECTORS_PER_PAGE));
        let swap = SwapArea::new(device);
        let frames = BitmapFrameAllocator::new(2);
        let pa = frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        swap.swap_out(&frames, pa).unwrap();
        let pa2 = frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        assert_eq!(swap.swap_out(&frames, pa2).unwrap_err(), KernelError::NoSpace);
    }
}
