//! C4: the per-process supplemental page table.

use super::swap::SwapArea;
use crate::inode::Inode;
use alloc::{collections::BTreeMap, sync::Arc};
use keos::{
    KernelError, debug,
    addressing::Va,
    mm::{FrameAllocator, VmMapper},
    sync::SpinLock,
};

/// What a non-resident or file-backed [`SptEntry`] is reclaimed from.
pub enum Backing {
    /// A plain anonymous page: reclaimed from and evicted to swap only.
    Anonymous,
    /// A page backed by a file region, installed by the mmap manager (C5).
    /// Reclaimable by re-reading the file instead of consuming a swap slot.
    File {
        file: Arc<Inode>,
        offset: usize,
        read_bytes: usize,
        mapping_id: usize,
    },
}

/// Per-virtual-page metadata consulted on page fault, syscall buffer
/// validation, and eviction.
pub struct SptEntry {
    pub vpn: Va,
    pub pfn: Option<keos::addressing::Pa>,
    pub writable: bool,
    pub pinned: bool,
    pub swap_idx: Option<usize>,
    pub backing: Backing,
}

impl SptEntry {
    /// A resident anonymous entry, e.g. the initial user stack page.
    pub fn anonymous(vpn: Va, pfn: keos::addressing::Pa, writable: bool, pinned: bool) -> Self {
        SptEntry {
            vpn,
            pfn: Some(pfn),
            writable,
            pinned,
            swap_idx: None,
            backing: Backing::Anonymous,
        }
    }

    /// A not-yet-resident file-backed entry, faulted in lazily.
    pub fn file_backed(
        vpn: Va,
        writable: bool,
        file: Arc<Inode>,
        offset: usize,
        read_bytes: usize,
        mapping_id: usize,
    ) -> Self {
        SptEntry {
            vpn,
            pfn: None,
            writable,
            pinned: false,
            swap_idx: None,
            backing: Backing::File {
                file,
                offset,
                read_bytes,
                mapping_id,
            },
        }
    }
}

/// The supplemental page table for one process: a map from page index to
/// [`SptEntry`], plus the frame allocator, VM mapper and swap area it calls
/// through on fault and eviction.
pub struct Spt {
    entries: SpinLock<BTreeMap<usize, SptEntry>>,
    frames: Arc<dyn FrameAllocator>,
    mapper: Arc<dyn VmMapper>,
    swap: Arc<SwapArea>,
}

impl Spt {
    /// Creates an empty table.
    pub fn new(frames: Arc<dyn FrameAllocator>, mapper: Arc<dyn VmMapper>, swap: Arc<SwapArea>) -> Self {
        Spt {
            entries: SpinLock::new(BTreeMap::new()),
            frames,
            mapper,
            swap,
        }
    }

    /// Inserts `entry`, keyed by its page-aligned `vpn`.
    ///
    /// # Errors
    /// Returns [`KernelError::FileExist`] if an entry already exists at
    /// that key.
    pub fn insert_spte(&self, entry: SptEntry) -> Result<(), KernelError> {
        let key = entry.vpn.page_index();
        let mut entries = self.entries.lock();
        let result = if entries.contains_key(&key) {
            Err(KernelError::FileExist)
        } else {
            entries.insert(key, entry);
            Ok(())
        };
        entries.unlock();
        result
    }

    /// Removes and tears down the entry for `va`'s page, releasing its
    /// frame or swap slot.
    pub fn delete_spte(&self, va: Va) -> Result<(), KernelError> {
        let key = va.page_floor().page_index();
        let mut entries = self.entries.lock();
        let removed = entries.remove(&key);
        entries.unlock();
        match removed {
            Some(mut entry) => {
                self.release(&mut entry);
                Ok(())
            }
            None => Err(KernelError::NoSuchEntry),
        }
    }

    /// Whether a (possibly non-resident) entry exists for `va`'s page.
    pub fn find_spt_entry(&self, va: Va) -> bool {
        let key = va.page_floor().page_index();
        let entries = self.entries.lock();
        let found = entries.contains_key(&key);
        entries.unlock();
        found
    }

    /// Whether `va`'s page has an entry that is currently mapped to a
    /// frame. Unlike [`Spt::find_spt_entry`], this is `false` for a
    /// present-but-swapped-out or present-but-not-yet-loaded entry, both of
    /// which still need a trip through [`super::handle_page_fault`] before
    /// they can be touched.
    pub fn is_resident(&self, va: Va) -> bool {
        let key = va.page_floor().page_index();
        let entries = self.entries.lock();
        let resident = entries.get(&key).is_some_and(|e| e.pfn.is_some());
        entries.unlock();
        resident
    }

    /// Marks the entry for `va`'s page pinned or unpinned.
    pub fn set_pinned(&self, va: Va, pinned: bool) -> Result<(), KernelError> {
        let key = va.page_floor().page_index();
        let mut entries = self.entries.lock();
        let result = match entries.get_mut(&key) {
            Some(e) => {
                e.pinned = pinned;
                Ok(())
            }
            None => Err(KernelError::NoSuchEntry),
        };
        entries.unlock();
        result
    }

    fn release(&self, entry: &mut SptEntry) {
        if let Some(pfn) = entry.pfn.take() {
            self.mapper.unmap(entry.vpn);
            self.frames.free_frame(pfn);
        }
        if let Some(slot) = entry.swap_idx.take() {
            self.swap.free_slot(slot);
        }
    }

    /// Tears down every entry: frees resident frames and swap slots alike.
    /// Called from process teardown.
    pub fn spt_destroy(&self) {
        let mut entries = self.entries.lock();
        let mut taken = BTreeMap::new();
        core::mem::swap(&mut *entries, &mut taken);
        entries.unlock();
        for (_, mut entry) in taken {
            self.release(&mut entry);
        }
    }

    /// Allocates a frame, evicting a non-pinned resident page if the
    /// allocator is out of memory.
    pub(crate) fn alloc_frame_with_eviction(&self) -> Result<keos::addressing::Pa, KernelError> {
        match self.frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO) {
            Ok(pa) => Ok(pa),
            Err(KernelError::NoMemory) => {
                self.page_evict()?;
                self.frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO)
            }
            Err(e) => Err(e),
        }
    }

    /// Evicts one non-pinned, currently resident page to swap.
    pub fn page_evict(&self) -> Result<(), KernelError> {
        let mut entries = self.entries.lock();
        let victim_key = entries
            .iter()
            .find(|(_, e)| !e.pinned && e.pfn.is_some())
            .map(|(k, _)| *k);
        let key = match victim_key {
            Some(k) => k,
            None => {
                entries.unlock();
                return Err(KernelError::NoMemory);
            }
        };
        let entry = entries.get_mut(&key).expect("victim key just looked up");
        let pfn = entry.pfn.take().expect("victim chosen for residency");
        self.mapper.unmap(entry.vpn);
        let slot = self.swap.swap_out(&*self.frames, pfn);
        match slot {
            Ok(slot) => {
                entry.swap_idx = Some(slot);
                self.frames.free_frame(pfn);
                debug!("spt: evicted page {:#x} to swap slot {slot}", entry.vpn.0);
                entries.unlock();
                Ok(())
            }
            Err(e) => {
                // Failed to write the victim out; put it back as resident
                // rather than losing track of the frame.
                entry.pfn = Some(pfn);
                entries.unlock();
                Err(e)
            }
        }
    }

    pub(crate) fn mapper(&self) -> &Arc<dyn VmMapper> {
        &self.mapper
    }

    pub(crate) fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    pub(crate) fn swap(&self) -> &Arc<SwapArea> {
        &self.swap
    }

    pub(crate) fn with_entry_mut<R>(&self, key: usize, f: impl FnOnce(&mut SptEntry) -> R) -> Option<R> {
        let mut entries = self.entries.lock();
        let result = entries.get_mut(&key).map(f);
        entries.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos::block::MemBlockDevice;
    use keos::config::PAGE_SIZE;
    use keos::mm::test_doubles::{BitmapFrameAllocator, SoftwareVmMapper};

    fn fixture(num_frames: usize) -> Spt {
        let frames = Arc::new(BitmapFrameAllocator::new(num_frames));
        let mapper = Arc::new(SoftwareVmMapper::new());
        let swap_device = Arc::new(MemBlockDevice::new(PAGE_SIZE / keos::config::SECTOR_SIZE * 8));
        let swap = Arc::new(SwapArea::new(swap_device));
        Spt::new(frames, mapper, swap)
    }

    #[test]
    fn insert_rejects_duplicate_key() {
        let spt = fixture(4);
        let pa = spt.frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        spt.insert_spte(SptEntry::anonymous(Va(0x1000), pa, true, false)).unwrap();
        let pa2 = spt.frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        assert_eq!(
            spt.insert_spte(SptEntry::anonymous(Va(0x1000), pa2, true, false)).unwrap_err(),
            KernelError::FileExist
        );
    }

    #[test]
    fn delete_frees_frame_and_unmaps() {
        let spt = fixture(4);
        let pa = spt.frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        spt.mapper.map(Va(0x1000), pa, true).unwrap();
        spt.insert_spte(SptEntry::anonymous(Va(0x1000), pa, true, false)).unwrap();
        spt.delete_spte(Va(0x1000)).unwrap();
        assert!(!spt.mapper.is_mapped(Va(0x1000)));
    }

    #[test]
    fn eviction_picks_unpinned_resident_entry() {
        let spt = fixture(1);
        let pa = spt.frames.alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO).unwrap();
        spt.insert_spte(SptEntry::anonymous(Va(0x1000), pa, true, true)).unwrap();
        // Only entry is pinned: eviction must fail, not silently succeed.
        assert_eq!(spt.page_evict().unwrap_err(), KernelError::NoMemory);

        spt.set_pinned(Va(0x1000), false).unwrap();
        spt.page_evict().unwrap();
        spt.with_entry_mut(Va(0x1000).page_index(), |e| {
            assert!(e.pfn.is_none());
            assert!(e.swap_idx.is_some());
        })
        .unwrap();
    }
}
