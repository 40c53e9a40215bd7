//! C1: a fixed-size sector cache over a [`BlockDevice`], with clock-hand
//! (second-chance) replacement and write-back on eviction.
//!
//! Every read and write holds the cache lock across the copy into or out of
//! the slot's buffer, including the device I/O needed to service a miss.
//! That serializes every cache user on a single mutex, which is deliberate:
//! it makes the lookup/admission race (two misses for the same sector
//! racing to admit two copies of it) structurally impossible instead of
//! something a second lock has to rule out.

use alloc::sync::Arc;
use keos::{
    KernelError, config,
    block::{BlockDevice, Sector},
    debug,
    sync::SpinLock,
};

const N: usize = config::CACHE_SIZE;
const SECTOR_SIZE: usize = config::SECTOR_SIZE;

#[derive(Clone)]
struct Entry {
    valid: bool,
    reference: bool,
    dirty: bool,
    sector_id: usize,
    data: [u8; SECTOR_SIZE],
}

impl Entry {
    const fn empty() -> Self {
        Entry {
            valid: false,
            reference: false,
            dirty: false,
            sector_id: 0,
            data: [0u8; SECTOR_SIZE],
        }
    }
}

struct CacheState {
    entries: alloc::vec::Vec<Entry>,
    hand: usize,
}

impl CacheState {
    /// Linear scan for the unique valid entry holding `sector`.
    fn find(&self, sector: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.valid && e.sector_id == sector)
    }

    /// Advances the clock hand until it lands on a victim slot, clearing
    /// reference bits along the way. Terminates within one lap: every slot
    /// visited has its reference bit cleared, so the second pass around
    /// finds one already clear (or an never-set invalid slot).
    fn clock_victim(&mut self) -> usize {
        loop {
            let i = self.hand;
            self.hand = (self.hand + 1) % N;
            if self.entries[i].reference {
                self.entries[i].reference = false;
            } else {
                return i;
            }
        }
    }
}

/// The sector-level buffer cache sitting between the inode layer and a
/// [`BlockDevice`].
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    state: SpinLock<CacheState>,
}

impl BufferCache {
    /// Builds an empty, all-invalid cache of [`config::CACHE_SIZE`] entries
    /// over `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        BufferCache {
            device,
            state: SpinLock::new(CacheState {
                entries: alloc::vec![Entry::empty(); N],
                hand: 0,
            }),
        }
    }

    /// Writes `entries[idx]` back to the device if it is valid and dirty,
    /// then clears the dirty bit. Caller holds the cache lock.
    fn flush_index(&self, state: &mut CacheState, idx: usize) -> Result<(), KernelError> {
        let entry = &mut state.entries[idx];
        if entry.valid && entry.dirty {
            self.device
                .write_sector(Sector(entry.sector_id), &entry.data)?;
            entry.dirty = false;
            debug!("buffer_cache: flushed dirty sector {}", entry.sector_id);
        }
        Ok(())
    }

    /// Finds or admits `sector`, returning its slot index. Caller holds the
    /// cache lock.
    fn lookup_or_admit(&self, state: &mut CacheState, sector: usize) -> Result<usize, KernelError> {
        if let Some(idx) = state.find(sector) {
            return Ok(idx);
        }
        let victim = state.clock_victim();
        if state.entries[victim].valid && state.entries[victim].dirty {
            debug!(
                "buffer_cache: evicting dirty sector {} for sector {}",
                state.entries[victim].sector_id, sector
            );
        }
        self.flush_index(state, victim)?;
        let mut data = [0u8; SECTOR_SIZE];
        self.device.read_sector(Sector(sector), &mut data)?;
        let entry = &mut state.entries[victim];
        entry.valid = true;
        entry.sector_id = sector;
        entry.data = data;
        entry.dirty = false;
        entry.reference = true;
        Ok(victim)
    }

    /// Copies `len` bytes from `sector[sec_off..sec_off+len]` into
    /// `dst[dst_off..dst_off+len]`.
    pub fn read(
        &self,
        sector: Sector,
        dst: &mut [u8],
        dst_off: usize,
        len: usize,
        sec_off: usize,
    ) -> Result<(), KernelError> {
        if sec_off + len > SECTOR_SIZE || dst_off + len > dst.len() {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let idx = self.lookup_or_admit(&mut state, sector.0)?;
        dst[dst_off..dst_off + len].copy_from_slice(&state.entries[idx].data[sec_off..sec_off + len]);
        state.entries[idx].reference = true;
        state.unlock();
        Ok(())
    }

    /// Copies `len` bytes from `src[src_off..src_off+len]` into
    /// `sector[sec_off..sec_off+len]` and marks the slot dirty.
    pub fn write(
        &self,
        sector: Sector,
        src: &[u8],
        src_off: usize,
        len: usize,
        sec_off: usize,
    ) -> Result<(), KernelError> {
        if sec_off + len > SECTOR_SIZE || src_off + len > src.len() {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let idx = self.lookup_or_admit(&mut state, sector.0)?;
        state.entries[idx].data[sec_off..sec_off + len].copy_from_slice(&src[src_off..src_off + len]);
        state.entries[idx].dirty = true;
        state.entries[idx].reference = true;
        state.unlock();
        Ok(())
    }

    /// Flushes every valid, dirty entry. Called from filesystem teardown.
    pub fn shutdown_flush(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        for idx in 0..N {
            self.flush_index(&mut state, idx)?;
        }
        state.unlock();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos::block::MemBlockDevice;

    fn cache(num_sectors: usize) -> BufferCache {
        BufferCache::new(Arc::new(MemBlockDevice::new(num_sectors)))
    }

    #[test]
    fn write_then_read_roundtrips() {
        let c = cache(4);
        let payload = [0xabu8; 10];
        c.write(Sector(0), &payload, 0, 10, 100).unwrap();
        let mut buf = [0u8; 10];
        c.read(Sector(0), &mut buf, 0, 10, 100).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn out_of_bounds_copy_is_rejected() {
        let c = cache(4);
        let buf = [0u8; 10];
        assert_eq!(
            c.write(Sector(0), &buf, 0, 10, SECTOR_SIZE - 5).unwrap_err(),
            KernelError::InvalidArgument
        );
    }

    #[test]
    fn at_most_one_entry_per_sector() {
        let c = cache(N + 5);
        for s in 0..N {
            c.read(Sector(s), &mut [0u8; 1], 0, 1, 0).unwrap();
        }
        // re-reading an already-cached sector must not grow the table.
        let state = c.state.lock();
        let valid_count = state.entries.iter().filter(|e| e.valid).count();
        state.unlock();
        assert_eq!(valid_count, N);
    }

    #[test]
    fn sixty_fifth_sector_evicts_and_flushes_dirty_victim_once() {
        let device = Arc::new(MemBlockDevice::new(N + 1));
        let c = BufferCache::new(device.clone());
        // Dirty every slot so the first eviction must write one back.
        for s in 0..N {
            c.write(Sector(s), &[(s + 1) as u8; 1], 0, 1, 0).unwrap();
        }
        // One more distinct sector forces an eviction.
        c.read(Sector(N), &mut [0u8; 1], 0, 1, 0).unwrap();

        let state = c.state.lock();
        let valid_count = state.entries.iter().filter(|e| e.valid).count();
        state.unlock();
        assert_eq!(valid_count, N);

        // The evicted sector's contents made it to the device exactly once.
        let mut readback = [0u8; 1];
        device.read_sector(Sector(0), &mut readback).unwrap();
        assert_eq!(readback[0], 1);
    }

    #[test]
    fn shutdown_flush_persists_all_dirty_entries() {
        let device = Arc::new(MemBlockDevice::new(4));
        let c = BufferCache::new(device.clone());
        c.write(Sector(2), &[0x42], 0, 1, 0).unwrap();
        c.shutdown_flush().unwrap();
        let mut readback = [0u8; 1];
        device.read_sector(Sector(2), &mut readback).unwrap();
        assert_eq!(readback[0], 0x42);
    }
}
