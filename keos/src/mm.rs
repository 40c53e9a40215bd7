//! Page-granularity memory and the trait contracts standing in for the
//! physical-frame allocator and the scheduler/page-table collaborator that
//! install translations into a live address space.
//!
//! The real `keos` kernel backs [`Page`] with a bitmap/buddy allocator tied
//! to the boot memory map. Frame allocation is out of scope here, so `Page`
//! is a boxed, owned 4 KiB buffer, and anything that needs frames talks to
//! one through the [`FrameAllocator`] trait instead.

use crate::{KernelError, addressing::Pa, config::PAGE_SIZE};
use alloc::boxed::Box;

/// An owned, page-sized, zero-initialized buffer.
///
/// Stands in for the teacher's reference-counted physical frame: here it is
/// just a box, since there is no physical memory map to carve frames out of.
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Allocates a new, zero-filled page.
    pub fn new() -> Self {
        Page {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Builds a page from existing contents.
    pub fn from_bytes(bytes: [u8; PAGE_SIZE]) -> Self {
        Page {
            data: Box::new(bytes),
        }
    }

    /// Borrows the page contents.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Mutably borrows the page contents.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

bitflags::bitflags! {
    /// Flags accompanying a [`FrameAllocator::alloc_frame`] request.
    pub struct AllocFlags: u32 {
        /// The frame will back user-accessible memory, as opposed to a
        /// kernel-private structural block (an indirect pointer block, a
        /// directory's own inode). Carried through for the allocator's
        /// bookkeeping; this crate's allocators don't special-case it.
        const USER = 1 << 0;
        /// Zero-fill the frame before returning it.
        const ZERO = 1 << 1;
    }
}

/// Hands out and reclaims physical frames.
///
/// A real kernel backs this with the boot-time physical memory map; tests
/// back it with a fixed-size bitmap over an in-memory arena.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame, returning its physical address.
    ///
    /// # Errors
    /// Returns [`KernelError::NoMemory`] if no frame is available.
    fn alloc_frame(&self, flags: AllocFlags) -> Result<Pa, KernelError>;

    /// Returns a previously allocated frame to the free pool.
    ///
    /// The caller must not access `pa` through any stale mapping afterward.
    fn free_frame(&self, pa: Pa);

    /// Reads or writes the contents of the frame at `pa`.
    ///
    /// Since this crate carries no real physical memory map, frame contents
    /// are reached through these accessors rather than raw pointers.
    fn with_frame<R>(&self, pa: Pa, f: &mut dyn FnMut(&mut [u8; PAGE_SIZE]) -> R) -> R;
}

/// Installs and removes page-table translations for a process's address
/// space.
///
/// Stands in for the scheduler/page-table collaborator: the demand-paging
/// and memory-mapping logic above this crate decides *what* should be
/// mapped where, and calls through a `VmMapper` to make the hardware (or, in
/// tests, a software model of it) agree.
pub trait VmMapper: Send + Sync {
    /// Installs a present mapping from `va`'s containing page to `pa`.
    ///
    /// # Errors
    /// Returns [`KernelError::FileExist`] if `va`'s page is already mapped;
    /// callers unmap it first if they mean to replace it.
    fn map(&self, va: crate::addressing::Va, pa: Pa, writable: bool) -> Result<(), KernelError>;

    /// Removes the mapping for `va`'s containing page, if any.
    fn unmap(&self, va: crate::addressing::Va);

    /// Reports whether `va` currently has a present mapping.
    fn is_mapped(&self, va: crate::addressing::Va) -> bool;

    /// Reports whether the page containing `va` has been written to since
    /// it was mapped (the hardware dirty bit).
    fn is_dirty(&self, va: crate::addressing::Va) -> bool;

    /// Clears the dirty bit for the page containing `va`.
    fn clear_dirty(&self, va: crate::addressing::Va);
}

pub mod test_doubles {
    //! In-memory test doubles for [`FrameAllocator`] and [`VmMapper`].
    //!
    //! Not `#[cfg(test)]`-gated: downstream crates exercising C4/C5 against
    //! these doubles need them compiled in ordinary (non-test) builds of
    //! this crate too, the same way [`crate::block::MemBlockDevice`] is.

    use super::*;
    use crate::addressing::Va;
    use crate::sync::SpinLock;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    /// A bitmap-backed [`FrameAllocator`] over a fixed number of frames.
    pub struct BitmapFrameAllocator {
        frames: SpinLock<Vec<([u8; PAGE_SIZE], bool)>>,
    }

    impl BitmapFrameAllocator {
        pub fn new(num_frames: usize) -> Self {
            BitmapFrameAllocator {
                frames: SpinLock::new(alloc::vec![([0u8; PAGE_SIZE], false); num_frames]),
            }
        }
    }

    impl FrameAllocator for BitmapFrameAllocator {
        fn alloc_frame(&self, _flags: AllocFlags) -> Result<Pa, KernelError> {
            let mut frames = self.frames.lock();
            let found = frames.iter().position(|(_, used)| !used);
            let result = match found {
                Some(idx) => {
                    // Always handed out zeroed, regardless of `ZERO`: there
                    // is no prior tenant's data to leak in this test double.
                    frames[idx].0 = [0u8; PAGE_SIZE];
                    frames[idx].1 = true;
                    Ok(Pa(idx * PAGE_SIZE))
                }
                None => Err(KernelError::NoMemory),
            };
            frames.unlock();
            result
        }

        fn free_frame(&self, pa: Pa) {
            let mut frames = self.frames.lock();
            let idx = pa.0 / PAGE_SIZE;
            frames[idx].1 = false;
            frames.unlock();
        }

        fn with_frame<R>(&self, pa: Pa, f: &mut dyn FnMut(&mut [u8; PAGE_SIZE]) -> R) -> R {
            let mut frames = self.frames.lock();
            let idx = pa.0 / PAGE_SIZE;
            let r = f(&mut frames[idx].0);
            frames.unlock();
            r
        }
    }

    /// A software model of a page table: a map from page-aligned `Va` to
    /// `(Pa, writable, dirty)`.
    pub struct SoftwareVmMapper {
        table: SpinLock<BTreeMap<usize, (Pa, bool, bool)>>,
    }

    impl SoftwareVmMapper {
        pub fn new() -> Self {
            SoftwareVmMapper {
                table: SpinLock::new(BTreeMap::new()),
            }
        }
    }

    impl Default for SoftwareVmMapper {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VmMapper for SoftwareVmMapper {
        fn map(&self, va: Va, pa: Pa, writable: bool) -> Result<(), KernelError> {
            let mut table = self.table.lock();
            let result = if table.contains_key(&va.page_floor().0) {
                Err(KernelError::FileExist)
            } else {
                table.insert(va.page_floor().0, (pa, writable, false));
                Ok(())
            };
            table.unlock();
            result
        }

        fn unmap(&self, va: Va) {
            let mut table = self.table.lock();
            table.remove(&va.page_floor().0);
            table.unlock();
        }

        fn is_mapped(&self, va: Va) -> bool {
            let table = self.table.lock();
            let r = table.contains_key(&va.page_floor().0);
            table.unlock();
            r
        }

        fn is_dirty(&self, va: Va) -> bool {
            let table = self.table.lock();
            let r = table
                .get(&va.page_floor().0)
                .map(|(_, _, dirty)| *dirty)
                .unwrap_or(false);
            table.unlock();
            r
        }

        fn clear_dirty(&self, va: Va) {
            let mut table = self.table.lock();
            if let Some(entry) = table.get_mut(&va.page_floor().0) {
                entry.2 = false;
            }
            table.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_doubles::{BitmapFrameAllocator, SoftwareVmMapper};
    use super::*;
    use crate::addressing::Va;

    #[test]
    fn mapping_an_already_mapped_page_fails() {
        let mapper = SoftwareVmMapper::new();
        let frames = BitmapFrameAllocator::new(2);
        let a = frames.alloc_frame(AllocFlags::USER | AllocFlags::ZERO).unwrap();
        let b = frames.alloc_frame(AllocFlags::USER | AllocFlags::ZERO).unwrap();
        mapper.map(Va(0x1000), a, true).unwrap();
        assert_eq!(mapper.map(Va(0x1000), b, true).unwrap_err(), KernelError::FileExist);
        mapper.unmap(Va(0x1000));
        mapper.map(Va(0x1000), b, true).unwrap();
    }
}
