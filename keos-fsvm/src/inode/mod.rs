//! C2: an on-disk inode with direct, indirect and double-indirect sector
//! indexing, lazy growth, and a process-wide open-inode table.
//!
//! The on-disk layout is bit-exact (see [`InodeDisk`]) so it can be mounted
//! on an existing image: 123 direct pointers, one indirect block of 128
//! pointers, and one double-indirect block reaching 128 indirect blocks of
//! 128 pointers each, for an addressable range of `123 + 128 + 128*128 =
//! 16,507` sectors.

mod disk_layout;

pub use disk_layout::{DIRECT_COUNT, DINDIRECT_COUNT, INDIRECT_COUNT, INODE_MAGIC, InodeDisk};

use crate::buffer_cache::BufferCache;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use keos::{
    KernelError, debug,
    block::{FreeMap, Sector},
    config::SECTOR_SIZE,
    sync::{SpinLock, atomic::AtomicBool, atomic::AtomicUsize},
    util::div_round_up,
};

/// An open inode, shared by every caller that has it open.
///
/// All data access goes through [`Inode::read_at`]/[`Inode::write_at`],
/// which serialize on `data_lock` the way spec.md's per-inode mutex does.
pub struct Inode {
    sector_id: usize,
    cache: Arc<BufferCache>,
    freemap: Arc<dyn FreeMap>,
    open_count: AtomicUsize,
    removed: AtomicBool,
    deny_write_count: AtomicUsize,
    data_lock: SpinLock<()>,
}

impl Inode {
    fn read_disk(&self) -> Result<InodeDisk, KernelError> {
        let mut raw = [0u8; SECTOR_SIZE];
        self.cache
            .read(Sector(self.sector_id), &mut raw, 0, SECTOR_SIZE, 0)?;
        InodeDisk::from_bytes(&raw)
    }

    fn write_disk(&self, disk: &InodeDisk) -> Result<(), KernelError> {
        let raw = disk.to_bytes();
        self.cache
            .write(Sector(self.sector_id), &raw, 0, SECTOR_SIZE, 0)
    }

    /// Sector number holding the on-disk inode record.
    pub fn inumber(&self) -> usize {
        self.sector_id
    }

    /// Logical length of the file, in bytes.
    pub fn length(&self) -> Result<usize, KernelError> {
        Ok(self.read_disk()?.length)
    }

    /// Whether this inode denotes a directory. Returns `false` once the
    /// inode has been unlinked, per spec.md's `inode_isdir` contract.
    pub fn is_dir(&self) -> Result<bool, KernelError> {
        if self.removed.load() {
            return Ok(false);
        }
        Ok(self.read_disk()?.is_dir)
    }

    /// Marks the inode for deletion once the last opener closes it.
    pub fn mark_removed(&self) {
        self.removed.store(true);
    }

    /// Whether the inode has been marked for deletion.
    pub fn is_removed(&self) -> bool {
        self.removed.load()
    }

    /// Increments the deny-write counter. While non-zero, writes return 0
    /// bytes written rather than failing outright.
    pub fn deny_write(&self) {
        self.deny_write_count.fetch_add(1);
    }

    /// Decrements the deny-write counter. The caller must have called
    /// [`deny_write`](Self::deny_write) first.
    pub fn allow_write(&self) {
        self.deny_write_count.fetch_sub(1);
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, stopping at EOF.
    /// Returns the number of bytes actually copied.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let guard = self.data_lock.lock();
        let disk = self.read_disk()?;
        let length = disk.length;
        let mut copied = 0usize;
        while copied < buf.len() && offset + copied < length {
            let pos = offset + copied;
            let sector = byte_to_sector(&disk, &self.cache, pos)?;
            let sec_off = pos % SECTOR_SIZE;
            let chunk = (buf.len() - copied)
                .min(SECTOR_SIZE - sec_off)
                .min(length - pos);
            match sector {
                Some(s) => self.cache.read(Sector(s as usize), buf, copied, chunk, sec_off)?,
                None => buf[copied..copied + chunk].fill(0),
            }
            copied += chunk;
        }
        guard.unlock();
        Ok(copied)
    }

    /// Writes `buf` starting at `offset`, growing the file first if the
    /// write extends past the current length. Returns 0 without touching
    /// anything if writes are currently denied.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        if self.deny_write_count.load() > 0 {
            return Ok(0);
        }
        let guard = self.data_lock.lock();
        let mut disk = self.read_disk()?;
        if offset + buf.len() > disk.length {
            grow_inode_disk(&mut disk, offset + buf.len(), &self.cache, &*self.freemap)?;
            self.write_disk(&disk)?;
        }
        let mut written = 0usize;
        while written < buf.len() {
            let pos = offset + written;
            let sector = byte_to_sector(&disk, &self.cache, pos)?
                .expect("grow_inode_disk must have allocated this sector");
            let sec_off = pos % SECTOR_SIZE;
            let chunk = (buf.len() - written).min(SECTOR_SIZE - sec_off);
            self.cache
                .write(Sector(sector as usize), buf, written, chunk, sec_off)?;
            written += chunk;
        }
        guard.unlock();
        Ok(written)
    }
}

/// Computes the on-device sector holding byte offset `pos`, per spec.md
/// §4.2. Returns `Ok(None)` for an allocated-but-zero (hole) pointer, and
/// `Err(FileTooLarge)` once `pos` exceeds the addressable range.
fn byte_to_sector(
    disk: &InodeDisk,
    cache: &BufferCache,
    pos: usize,
) -> Result<Option<u32>, KernelError> {
    let idx = pos / SECTOR_SIZE;
    if idx < DIRECT_COUNT {
        return Ok(nonzero(disk.direct[idx]));
    }
    let idx = idx - DIRECT_COUNT;
    if idx < INDIRECT_COUNT {
        return Ok(match nonzero(disk.indirect) {
            Some(ind) => nonzero(read_ptr_block(cache, ind)?[idx]),
            None => None,
        });
    }
    let idx = idx - INDIRECT_COUNT;
    if idx < DINDIRECT_COUNT {
        let outer_idx = idx / INDIRECT_COUNT;
        let inner_idx = idx % INDIRECT_COUNT;
        return Ok(match nonzero(disk.d_indirect) {
            Some(d) => match nonzero(read_ptr_block(cache, d)?[outer_idx]) {
                Some(ind) => nonzero(read_ptr_block(cache, ind)?[inner_idx]),
                None => None,
            },
            None => None,
        });
    }
    Err(KernelError::FileTooLarge)
}

fn nonzero(v: u32) -> Option<u32> {
    if v == 0 { None } else { Some(v) }
}

fn read_ptr_block(cache: &BufferCache, sector: u32) -> Result<[u32; 128], KernelError> {
    let mut raw = [0u8; SECTOR_SIZE];
    cache.read(Sector(sector as usize), &mut raw, 0, SECTOR_SIZE, 0)?;
    let mut out = [0u32; 128];
    for (i, chunk) in raw.chunks_exact(4).enumerate() {
        out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(out)
}

fn write_ptr_block(cache: &BufferCache, sector: u32, block: &[u32; 128]) -> Result<(), KernelError> {
    let mut raw = [0u8; SECTOR_SIZE];
    for (i, v) in block.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    cache.write(Sector(sector as usize), &raw, 0, SECTOR_SIZE, 0)
}

fn zero_sector(cache: &BufferCache, sector: u32) -> Result<(), KernelError> {
    cache.write(Sector(sector as usize), &[0u8; SECTOR_SIZE], 0, SECTOR_SIZE, 0)
}

fn alloc_one(freemap: &dyn FreeMap) -> Result<u32, KernelError> {
    Ok(freemap.allocate(1)?[0] as u32)
}

/// Records `sector_id` at logical block `idx`, allocating indirect/
/// double-indirect structural blocks on demand. Always reads an existing
/// indirect block before overwriting any of its other entries.
fn set_pointer(
    disk: &mut InodeDisk,
    idx: usize,
    sector_id: u32,
    cache: &BufferCache,
    freemap: &dyn FreeMap,
) -> Result<(), KernelError> {
    if idx < DIRECT_COUNT {
        disk.direct[idx] = sector_id;
        return Ok(());
    }
    let idx = idx - DIRECT_COUNT;
    if idx < INDIRECT_COUNT {
        if disk.indirect == 0 {
            let s = alloc_one(freemap)?;
            zero_sector(cache, s)?;
            disk.indirect = s;
            debug!("inode: growth crossed into the indirect block");
        }
        let mut block = read_ptr_block(cache, disk.indirect)?;
        block[idx] = sector_id;
        return write_ptr_block(cache, disk.indirect, &block);
    }
    let idx = idx - INDIRECT_COUNT;
    if idx < DINDIRECT_COUNT {
        if disk.d_indirect == 0 {
            let s = alloc_one(freemap)?;
            zero_sector(cache, s)?;
            disk.d_indirect = s;
            debug!("inode: growth crossed into the double-indirect block");
        }
        let outer_idx = idx / INDIRECT_COUNT;
        let inner_idx = idx % INDIRECT_COUNT;
        let mut outer = read_ptr_block(cache, disk.d_indirect)?;
        if outer[outer_idx] == 0 {
            let s = alloc_one(freemap)?;
            zero_sector(cache, s)?;
            outer[outer_idx] = s;
            write_ptr_block(cache, disk.d_indirect, &outer)?;
        }
        let mut inner = read_ptr_block(cache, outer[outer_idx])?;
        inner[inner_idx] = sector_id;
        return write_ptr_block(cache, outer[outer_idx], &inner);
    }
    Err(KernelError::FileTooLarge)
}

/// Idempotently extends `disk` to `new_length` bytes, allocating and
/// zero-filling every data sector not already allocated.
fn grow_inode_disk(
    disk: &mut InodeDisk,
    new_length: usize,
    cache: &BufferCache,
    freemap: &dyn FreeMap,
) -> Result<(), KernelError> {
    let old_sectors = div_round_up(disk.length, SECTOR_SIZE);
    let new_sectors = div_round_up(new_length, SECTOR_SIZE);
    for idx in old_sectors..new_sectors {
        let data_sector = alloc_one(freemap)?;
        zero_sector(cache, data_sector)?;
        set_pointer(disk, idx, data_sector, cache, freemap)?;
    }
    disk.length = new_length;
    Ok(())
}

/// Releases every data, indirect and double-indirect sector allocated to
/// `disk` back to the free map. Called when a removed inode's last opener
/// closes it.
fn free_all_blocks(disk: &InodeDisk, cache: &BufferCache, freemap: &dyn FreeMap) -> Result<(), KernelError> {
    let mut to_free = Vec::new();
    for &s in disk.direct.iter() {
        if s != 0 {
            to_free.push(s as usize);
        }
    }
    if disk.indirect != 0 {
        let block = read_ptr_block(cache, disk.indirect)?;
        to_free.extend(block.iter().filter(|&&s| s != 0).map(|&s| s as usize));
        to_free.push(disk.indirect as usize);
    }
    if disk.d_indirect != 0 {
        let outer = read_ptr_block(cache, disk.d_indirect)?;
        for &ind in outer.iter() {
            if ind != 0 {
                let inner = read_ptr_block(cache, ind)?;
                to_free.extend(inner.iter().filter(|&&s| s != 0).map(|&s| s as usize));
                to_free.push(ind as usize);
            }
        }
        to_free.push(disk.d_indirect as usize);
    }
    freemap.release(&to_free);
    Ok(())
}

/// The process-wide table of currently open inodes, keyed by the sector
/// holding their on-disk record. Duplicate opens of the same sector return
/// the same [`Inode`], with `open_count` tracking how many.
pub struct InodeTable {
    cache: Arc<BufferCache>,
    freemap: Arc<dyn FreeMap>,
    open: SpinLock<BTreeMap<usize, Arc<Inode>>>,
}

impl InodeTable {
    /// Builds an empty table over `cache`, allocating new inodes and data
    /// blocks from `freemap`.
    pub fn new(cache: Arc<BufferCache>, freemap: Arc<dyn FreeMap>) -> Self {
        InodeTable {
            cache,
            freemap,
            open: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Allocates a single free sector from the free map, for callers (the
    /// directory layer) that need a sector number before they can create
    /// the inode that will live there.
    pub fn allocate_entry_sector(&self) -> Result<usize, KernelError> {
        Ok(self.freemap.allocate(1)?[0])
    }

    /// Initializes a new inode at `sector`, growing it to `length` bytes
    /// and writing the resulting record. Does not add it to the open
    /// table; callers typically `inode_open` it immediately afterward.
    pub fn inode_create(&self, sector: usize, length: usize, is_dir: bool) -> Result<(), KernelError> {
        let mut disk = InodeDisk::empty(is_dir);
        grow_inode_disk(&mut disk, length, &self.cache, &*self.freemap)?;
        let raw = disk.to_bytes();
        self.cache.write(Sector(sector), &raw, 0, SECTOR_SIZE, 0)
    }

    /// Opens (or reopens) the inode at `sector`.
    pub fn inode_open(&self, sector: usize) -> Result<Arc<Inode>, KernelError> {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&sector) {
            existing.open_count.fetch_add(1);
            let inode = existing.clone();
            open.unlock();
            return Ok(inode);
        }
        let inode = Arc::new(Inode {
            sector_id: sector,
            cache: self.cache.clone(),
            freemap: self.freemap.clone(),
            open_count: AtomicUsize::new(1),
            removed: AtomicBool::new(false),
            deny_write_count: AtomicUsize::new(0),
            data_lock: SpinLock::new(()),
        });
        open.insert(sector, inode.clone());
        open.unlock();
        Ok(inode)
    }

    /// Closes one reference to `inode`. Once `open_count` reaches zero, the
    /// inode is dropped from the table, and if it was marked removed, its
    /// data blocks and its own sector are released.
    pub fn inode_close(&self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        if inode.open_count.fetch_sub(1) != 1 {
            return Ok(());
        }
        let mut open = self.open.lock();
        open.remove(&inode.sector_id);
        open.unlock();
        if inode.removed.load() {
            let disk = inode.read_disk()?;
            free_all_blocks(&disk, &self.cache, &*self.freemap)?;
            self.freemap.release(&[inode.sector_id]);
        }
        Ok(())
    }
}
