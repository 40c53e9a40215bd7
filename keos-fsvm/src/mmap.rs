//! C5: memory-mapped files, layered on the C4 supplemental page table.
//!
//! A mapping installs one file-backed [`crate::vm::SptEntry`] per page of
//! the mapped file; pages are faulted in lazily by the same page-fault
//! policy that services demand-paged executables. `munmap` writes every
//! page of the mapping back to its file unconditionally rather than relying
//! on a hardware dirty bit, since a page that was evicted to swap no longer
//! carries its dirty bit once reloaded through a different path than a
//! fault.

use crate::inode::{Inode, InodeTable};
use crate::vm::{Spt, SptEntry};
use alloc::{collections::BTreeMap, sync::Arc};
use keos::{
    KernelError,
    addressing::Va,
    config::PAGE_SIZE,
    sync::{SpinLock, atomic::AtomicUsize},
    util::div_round_up,
};

struct Mapping {
    file: Arc<Inode>,
    start: Va,
    num_pages: usize,
    file_length: usize,
}

/// A process's table of live memory mappings, keyed by a monotonically
/// increasing `mapping_id` (never reused list-index arithmetic, so a
/// `munmap` racing a later `mmap` can't be confused about which mapping it
/// names).
pub struct MmapTable {
    mappings: SpinLock<BTreeMap<usize, Mapping>>,
    next_id: AtomicUsize,
}

impl MmapTable {
    pub fn new() -> Self {
        MmapTable {
            mappings: SpinLock::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps `file` into the address space starting at `addr`, one file-backed
/// SPT entry per page. Fails rather than overlapping an existing mapping or
/// any other installed page.
///
/// # Errors
/// - [`KernelError::InvalidArgument`] if `addr` is zero, unaligned, or the
///   file is empty.
/// - [`KernelError::FileExist`] if any target page already has an entry.
pub fn mmap(
    spt: &Spt,
    inode_table: &InodeTable,
    mappings: &MmapTable,
    file: &Arc<Inode>,
    addr: Va,
) -> Result<usize, KernelError> {
    if addr.0 == 0 || !addr.is_page_aligned() {
        return Err(KernelError::InvalidArgument);
    }
    let file_length = file.length()?;
    if file_length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let num_pages = div_round_up(file_length, PAGE_SIZE);
    for i in 0..num_pages {
        if spt.find_spt_entry(addr + i * PAGE_SIZE) {
            return Err(KernelError::FileExist);
        }
    }

    let mapped_file = inode_table.inode_open(file.inumber())?;
    let mapping_id = mappings.next_id.fetch_add(1);

    for i in 0..num_pages {
        let va = addr + i * PAGE_SIZE;
        let offset = i * PAGE_SIZE;
        let read_bytes = (file_length - offset).min(PAGE_SIZE);
        let entry = SptEntry::file_backed(va, true, mapped_file.clone(), offset, read_bytes, mapping_id);
        spt.insert_spte(entry)
            .expect("page availability was just verified with no intervening insert");
    }

    let mut table = mappings.mappings.lock();
    table.insert(
        mapping_id,
        Mapping {
            file: mapped_file,
            start: addr,
            num_pages,
            file_length,
        },
    );
    table.unlock();
    Ok(mapping_id)
}

enum Residency {
    Frame(keos::addressing::Pa),
    Swap(usize),
    Never,
}

/// Unmaps `mapping_id`: writes every page back to its file, then releases
/// the frame or swap slot backing it and drops the SPT entry.
///
/// # Errors
/// Returns [`KernelError::NoSuchEntry`] if `mapping_id` is not live.
pub fn munmap(spt: &Spt, inode_table: &InodeTable, mappings: &MmapTable, mapping_id: usize) -> Result<(), KernelError> {
    let mut table = mappings.mappings.lock();
    let mapping = table.remove(&mapping_id);
    table.unlock();
    let mapping = mapping.ok_or(KernelError::NoSuchEntry)?;

    for i in 0..mapping.num_pages {
        let va = mapping.start + i * PAGE_SIZE;
        let offset = i * PAGE_SIZE;
        let read_bytes = (mapping.file_length - offset).min(PAGE_SIZE);
        let key = va.page_index();

        let residency = spt
            .with_entry_mut(key, |e| {
                if let Some(pa) = e.pfn {
                    Residency::Frame(pa)
                } else if let Some(slot) = e.swap_idx {
                    Residency::Swap(slot)
                } else {
                    Residency::Never
                }
            })
            .unwrap_or(Residency::Never);

        match residency {
            Residency::Frame(pa) => {
                spt.frames()
                    .with_frame(pa, &mut |buf| mapping.file.write_at(&buf[..read_bytes], offset))?;
            }
            Residency::Swap(slot) => {
                let scratch = spt.frames().alloc_frame(keos::mm::AllocFlags::USER | keos::mm::AllocFlags::ZERO)?;
                spt.swap().swap_in(&**spt.frames(), slot, scratch)?;
                spt.frames()
                    .with_frame(scratch, &mut |buf| mapping.file.write_at(&buf[..read_bytes], offset))?;
                spt.frames().free_frame(scratch);
                spt.with_entry_mut(key, |e| e.swap_idx = None);
            }
            Residency::Never => {}
        }

        spt.delete_spte(va)?;
    }

    inode_table.inode_close(&mapping.file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_cache::BufferCache;
    use crate::vm::Spt;
    use keos::block::{BitmapFreeMap, MemBlockDevice};
    use keos::mm::test_doubles::{BitmapFrameAllocator, SoftwareVmMapper};

    const TOTAL_SECTORS: usize = 20_000;

    fn fixture() -> (InodeTable, Spt, MmapTable) {
        let device = Arc::new(MemBlockDevice::new(TOTAL_SECTORS));
        let cache = Arc::new(BufferCache::new(device));
        let freemap = Arc::new(BitmapFreeMap::new(TOTAL_SECTORS));
        freemap.allocate(1).unwrap();
        let inode_table = InodeTable::new(cache, freemap);

        let frames = Arc::new(BitmapFrameAllocator::new(8));
        let mapper = Arc::new(SoftwareVmMapper::new());
        let swap_device = Arc::new(MemBlockDevice::new(PAGE_SIZE / keos::config::SECTOR_SIZE * 8));
        let swap = Arc::new(crate::vm::SwapArea::new(swap_device));
        let spt = Spt::new(frames, mapper, swap);

        (inode_table, spt, MmapTable::new())
    }

    #[test]
    fn mmap_fault_in_roundtrip_write_back_on_munmap() {
        let (inode_table, spt, mappings) = fixture();
        inode_table.inode_create(2, 0, false).unwrap();
        let file = inode_table.inode_open(2).unwrap();
        file.write_at(b"hello, mmap", 0).unwrap();

        let addr = Va(0x1000_0000);
        let id = mmap(&spt, &inode_table, &mappings, &file, addr).unwrap();

        crate::vm::handle_page_fault(&spt, addr, 0).unwrap();
        let pa = spt.with_entry_mut(addr.page_index(), |e| e.pfn.unwrap()).unwrap();
        spt.frames().with_frame(pa, &mut |buf| {
            buf[0] = b'H'; // simulate a user write through the mapping
        });

        munmap(&spt, &inode_table, &mappings, id).unwrap();
        let mut readback = [0u8; 11];
        file.read_at(&mut readback, 0).unwrap();
        assert_eq!(&readback, b"Hello, mmap");
        inode_table.inode_close(&file).unwrap();
    }

    #[test]
    fn mmap_rejects_overlap_with_existing_mapping() {
        let (inode_table, spt, mappings) = fixture();
        inode_table.inode_create(2, 0, false).unwrap();
        let a = inode_table.inode_open(2).unwrap();
        a.write_at(b"abc", 0).unwrap();
        inode_table.inode_create(3, 0, false).unwrap();
        let b = inode_table.inode_open(3).unwrap();
        b.write_at(b"xyz", 0).unwrap();

        let addr = Va(0x2000_0000);
        mmap(&spt, &inode_table, &mappings, &a, addr).unwrap();
        assert_eq!(
            mmap(&spt, &inode_table, &mappings, &b, addr).unwrap_err(),
            KernelError::FileExist
        );
        inode_table.inode_close(&a).unwrap();
        inode_table.inode_close(&b).unwrap();
    }

    #[test]
    fn mmap_rejects_empty_file() {
        let (inode_table, spt, mappings) = fixture();
        inode_table.inode_create(2, 0, false).unwrap();
        let file = inode_table.inode_open(2).unwrap();
        assert_eq!(
            mmap(&spt, &inode_table, &mappings, &file, Va(0x3000_0000)).unwrap_err(),
            KernelError::InvalidArgument
        );
        inode_table.inode_close(&file).unwrap();
    }
}
