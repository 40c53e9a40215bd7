//! C4: the page-fault policy that decides what a faulting access means.

use super::spt::{Backing, Spt, SptEntry};
use alloc::sync::Arc;
use keos::{
    KernelError, debug,
    addressing::Va,
    config::{PAGE_SIZE, PHYS_BASE, STACK_GROWTH_LIMIT, STACK_GROWTH_SLACK},
};

/// Whether `fault_va` falls within the automatic-stack-growth window below
/// `esp`, per spec.md §4.4: at most `STACK_GROWTH_SLACK` bytes below the
/// stack pointer, and no further than `STACK_GROWTH_LIMIT` below
/// [`PHYS_BASE`].
fn in_stack_growth_window(fault_va: Va, esp: usize) -> bool {
    if fault_va.0 + STACK_GROWTH_SLACK < esp {
        return false;
    }
    fault_va.0 < PHYS_BASE && fault_va.0 + STACK_GROWTH_LIMIT >= PHYS_BASE
}

/// Services a page fault at `fault_va`, with the faulting thread's current
/// stack pointer `esp` (needed to recognize stack growth).
///
/// Applies spec.md §4.4's policy in order:
/// 1. A swapped-out entry is swapped back in.
/// 2. A not-yet-resident file-backed entry is faulted in from its file.
/// 3. An unmapped address within the stack-growth window grows the stack.
/// 4. Anything else is not this process's fault to recover from.
///
/// # Errors
/// Returns [`KernelError::BadAddress`] if none of the above apply; the
/// syscall layer turns that into process termination.
pub fn handle_page_fault(spt: &Spt, fault_va: Va, esp: usize) -> Result<(), KernelError> {
    let key = fault_va.page_floor().page_index();

    let needs_swap_in = spt
        .with_entry_mut(key, |e| e.swap_idx.is_some())
        .unwrap_or(false);
    if needs_swap_in {
        return swap_in_entry(spt, key);
    }

    let needs_file_load = spt
        .with_entry_mut(key, |e| e.pfn.is_none() && e.swap_idx.is_none())
        .unwrap_or(false);
    if needs_file_load {
        return load_file_backed(spt, key);
    }

    let already_resident = spt.with_entry_mut(key, |_| ()).is_some();
    if already_resident {
        // Entry exists and is already mapped: nothing for the fault handler
        // to do (e.g. a stray write-protection fault on a read-only page).
        return Err(KernelError::InvalidAccess);
    }

    if in_stack_growth_window(fault_va, esp) {
        return grow_stack(spt, fault_va.page_floor());
    }

    Err(KernelError::BadAddress)
}

fn swap_in_entry(spt: &Spt, key: usize) -> Result<(), KernelError> {
    let pa = spt.alloc_frame_with_eviction()?;
    let slot = spt
        .with_entry_mut(key, |e| e.swap_idx.take())
        .flatten()
        .expect("needs_swap_in just confirmed a slot");
    spt.swap().swap_in(&**spt.frames(), slot, pa)?;
    let (vpn, writable) = spt
        .with_entry_mut(key, |e| (e.vpn, e.writable))
        .expect("entry still present");
    spt.mapper().map(vpn, pa, writable)?;
    spt.with_entry_mut(key, |e| e.pfn = Some(pa));
    debug!("vm: swapped page {:#x} back in from slot {slot}", vpn.0);
    Ok(())
}

fn load_file_backed(spt: &Spt, key: usize) -> Result<(), KernelError> {
    let pa = spt.alloc_frame_with_eviction()?;
    let (vpn, writable, file, offset, read_bytes) = spt
        .with_entry_mut(key, |e| match &e.backing {
            Backing::File {
                file,
                offset,
                read_bytes,
                ..
            } => (e.vpn, e.writable, file.clone(), *offset, *read_bytes),
            Backing::Anonymous => unreachable!("anonymous entry cannot be non-resident without a swap slot"),
        })
        .expect("entry still present");

    spt.frames().with_frame(pa, &mut |buf| -> Result<(), KernelError> {
        buf.fill(0);
        let n = file.read_at(&mut buf[..read_bytes.min(PAGE_SIZE)], offset)?;
        if n < PAGE_SIZE {
            buf[n..].fill(0);
        }
        Ok(())
    })?;
    spt.mapper().map(vpn, pa, writable)?;
    spt.with_entry_mut(key, |e| e.pfn = Some(pa));
    Ok(())
}

fn grow_stack(spt: &Spt, vpn: Va) -> Result<(), KernelError> {
    let pa = spt.alloc_frame_with_eviction()?;
    spt.mapper().map(vpn, pa, true)?;
    spt.insert_spte(SptEntry::anonymous(vpn, pa, true, false))?;
    debug!("vm: grew stack to include page {:#x}", vpn.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeTable;
    use crate::vm::spt::Spt;
    use crate::vm::swap::SwapArea;
    use keos::block::{BitmapFreeMap, MemBlockDevice};
    use keos::mm::test_doubles::{BitmapFrameAllocator, SoftwareVmMapper};

    const TOTAL_SECTORS: usize = 20_000;

    fn fixture() -> Spt {
        let frames = Arc::new(BitmapFrameAllocator::new(8));
        let mapper = Arc::new(SoftwareVmMapper::new());
        let swap_device = Arc::new(MemBlockDevice::new(PAGE_SIZE / keos::config::SECTOR_SIZE * 8));
        let swap = Arc::new(SwapArea::new(swap_device));
        Spt::new(frames, mapper, swap)
    }

    #[test]
    fn stack_growth_window_admits_a_push_right_below_esp() {
        let esp = PHYS_BASE - 4096;
        let fault_va = Va(esp - 4);
        assert!(in_stack_growth_window(fault_va, esp));
    }

    #[test]
    fn address_far_from_esp_and_outside_growth_limit_is_rejected() {
        let esp = PHYS_BASE - 4096;
        let fault_va = Va(PHYS_BASE - STACK_GROWTH_LIMIT - PAGE_SIZE);
        assert!(!in_stack_growth_window(fault_va, esp));
    }

    #[test]
    fn fault_within_stack_window_installs_a_fresh_zeroed_page() {
        let spt = fixture();
        let esp = PHYS_BASE - 4;
        let fault_va = Va(esp - 4);
        handle_page_fault(&spt, fault_va, esp).unwrap();
        assert!(spt.find_spt_entry(fault_va));
    }

    #[test]
    fn fault_outside_any_window_is_rejected() {
        let spt = fixture();
        let esp = PHYS_BASE - 4096;
        let fault_va = Va(0x1000);
        assert_eq!(handle_page_fault(&spt, fault_va, esp).unwrap_err(), KernelError::BadAddress);
    }

    #[test]
    fn faulting_swapped_entry_restores_contents() {
        let spt = fixture();
        let pa = spt.alloc_frame_with_eviction().unwrap();
        let vpn = Va(0x4000);
        spt.frames().with_frame(pa, &mut |buf| buf.fill(0x5a));
        spt.insert_spte(crate::vm::spt::SptEntry::anonymous(vpn, pa, true, false)).unwrap();
        spt.page_evict().unwrap();

        handle_page_fault(&spt, vpn, 0).unwrap();
        let restored_pa = spt.with_entry_mut(vpn.page_index(), |e| e.pfn.unwrap()).unwrap();
        let mut byte = 0u8;
        spt.frames().with_frame(restored_pa, &mut |buf| byte = buf[0]);
        assert_eq!(byte, 0x5a);
    }

    #[test]
    fn faulting_file_backed_entry_loads_bytes_and_zero_pads() {
        let device = Arc::new(MemBlockDevice::new(TOTAL_SECTORS));
        let cache = Arc::new(crate::buffer_cache::BufferCache::new(device));
        let freemap = Arc::new(BitmapFreeMap::new(TOTAL_SECTORS));
        freemap.allocate(1).unwrap();
        let table = InodeTable::new(cache, freemap);
        table.inode_create(1, 0, false).unwrap();
        let file = table.inode_open(1).unwrap();
        file.write_at(b"hello", 0).unwrap();

        let spt = fixture();
        let vpn = Va(0x8000);
        spt.insert_spte(crate::vm::spt::SptEntry::file_backed(vpn, false, file, 0, 5, 1)).unwrap();
        handle_page_fault(&spt, vpn, 0).unwrap();
        let pa = spt.with_entry_mut(vpn.page_index(), |e| e.pfn.unwrap()).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        spt.frames().with_frame(pa, &mut |b| buf.copy_from_slice(b));
        assert_eq!(&buf[0..5], b"hello");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }
}
