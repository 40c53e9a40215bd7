//! The filesystem lifecycle: formatting a fresh device, mounting an
//! existing one, and flushing everything back on shutdown.
//!
//! The free map has no inode of its own (spec.md §6): it has to be
//! bootstrapped at a fixed sector range before any inode can be allocated,
//! and persisted back to that same range on shutdown. `format` builds a
//! fresh bitmap and root directory; `mount` reads an existing bitmap back
//! and reopens the root; `shutdown` flushes the buffer cache and writes
//! the bitmap back out, mirroring the original's `do_format`/`filesys_init`
//! split.

use crate::buffer_cache::BufferCache;
use crate::directory::Directory;
use crate::inode::InodeTable;
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::{
    KernelError,
    block::{BitmapFreeMap, BlockDevice, FreeMap, Sector},
    config::SECTOR_SIZE,
    util::div_round_up,
};

const FREE_MAP_START_SECTOR: usize = 0;

fn free_map_sector_count(num_sectors: usize) -> usize {
    div_round_up(num_sectors, SECTOR_SIZE * 8)
}

fn bits_to_sectors(bits: &[bool]) -> Vec<[u8; SECTOR_SIZE]> {
    let count = div_round_up(bits.len(), SECTOR_SIZE * 8);
    let mut out = alloc::vec![[0u8; SECTOR_SIZE]; count];
    for (i, &set) in bits.iter().enumerate() {
        if set {
            out[i / (SECTOR_SIZE * 8)][(i % (SECTOR_SIZE * 8)) / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn sectors_to_bits(sectors: &[[u8; SECTOR_SIZE]], num_bits: usize) -> Vec<bool> {
    let mut out = alloc::vec![false; num_bits];
    for (i, bit) in out.iter_mut().enumerate() {
        let byte = sectors[i / (SECTOR_SIZE * 8)][(i % (SECTOR_SIZE * 8)) / 8];
        *bit = byte & (1 << (i % 8)) != 0;
    }
    out
}

/// The mounted filesystem: buffer cache, free map, inode table, and root
/// directory, wired together and ready for path resolution.
pub struct Filesystem {
    cache: Arc<BufferCache>,
    freemap: Arc<BitmapFreeMap>,
    inode_table: Arc<InodeTable>,
    root: Directory,
}

impl Filesystem {
    pub fn inode_table(&self) -> &Arc<InodeTable> {
        &self.inode_table
    }

    /// A fresh handle onto the root directory, independently closeable from
    /// the one `Filesystem` itself holds.
    pub fn root(&self) -> Result<Directory, KernelError> {
        self.root.reopen(&self.inode_table)
    }

    /// Formats a fresh filesystem onto `device`: reserves the free map's own
    /// bootstrap sectors and the root directory's sector, then creates an
    /// empty root directory inode.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Filesystem, KernelError> {
        let num_sectors = device.num_sectors();
        let free_map_sectors = free_map_sector_count(num_sectors);
        let cache = Arc::new(BufferCache::new(device));
        let freemap = Arc::new(BitmapFreeMap::new(num_sectors));

        // BitmapFreeMap::allocate hands back the lowest free sectors first,
        // so against a freshly formatted bitmap this reserves
        // [0, free_map_sectors) for the bitmap's own persisted bytes and the
        // very next sector for the root directory.
        freemap.allocate(free_map_sectors)?;
        let root_sector = freemap.allocate(1)?[0];

        let inode_table = Arc::new(InodeTable::new(cache.clone(), freemap.clone()));
        inode_table.inode_create(root_sector, 0, true)?;
        let root_inode = inode_table.inode_open(root_sector)?;
        let root = Directory::from_inode(root_inode);
        root.add(".", root_sector)?;
        root.add("..", root_sector)?;

        let fs = Filesystem {
            cache,
            freemap,
            inode_table,
            root,
        };
        fs.persist_free_map()?;
        Ok(fs)
    }

    /// Mounts a previously formatted `device`: reads the free-map bitmap
    /// back from its bootstrap sectors and opens the root directory at the
    /// sector immediately following it.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Filesystem, KernelError> {
        let num_sectors = device.num_sectors();
        let free_map_sectors = free_map_sector_count(num_sectors);
        let cache = Arc::new(BufferCache::new(device));

        let mut raw = alloc::vec![[0u8; SECTOR_SIZE]; free_map_sectors];
        for (i, sector) in raw.iter_mut().enumerate() {
            cache.read(Sector(FREE_MAP_START_SECTOR + i), &mut sector[..], 0, SECTOR_SIZE, 0)?;
        }
        let bits = sectors_to_bits(&raw, num_sectors);
        let freemap = Arc::new(BitmapFreeMap::from_bits(bits));

        let root_sector = free_map_sectors;
        let inode_table = Arc::new(InodeTable::new(cache.clone(), freemap.clone()));
        let root_inode = inode_table.inode_open(root_sector)?;
        let root = Directory::from_inode(root_inode);

        Ok(Filesystem {
            cache,
            freemap,
            inode_table,
            root,
        })
    }

    fn persist_free_map(&self) -> Result<(), KernelError> {
        let bits = self.freemap.snapshot();
        let packed = bits_to_sectors(&bits);
        for (i, sector) in packed.iter().enumerate() {
            self.cache
                .write(Sector(FREE_MAP_START_SECTOR + i), &sector[..], 0, SECTOR_SIZE, 0)?;
        }
        Ok(())
    }

    /// Persists the current free-map bitmap and flushes every dirty buffer
    /// cache entry back to the device. Called once from process/VM teardown
    /// (spec.md §4.1's `shutdown_flush`), not per-entry eviction.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        self.persist_free_map()?;
        self.cache.shutdown_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos::block::{FreeMap, MemBlockDevice};

    const TOTAL_SECTORS: usize = 20_000;

    #[test]
    fn format_then_mount_sees_the_same_root_directory() {
        let device = Arc::new(MemBlockDevice::new(TOTAL_SECTORS));
        let fs = Filesystem::format(device.clone()).unwrap();
        fs.inode_table()
            .inode_create(fs.inode_table().allocate_entry_sector().unwrap(), 0, false)
            .unwrap();
        fs.shutdown().unwrap();

        let remounted = Filesystem::mount(device).unwrap();
        let root = remounted.root().unwrap();
        assert_eq!(root.ino(), remounted.root().unwrap().ino());
    }

    #[test]
    fn allocated_sectors_survive_a_shutdown_and_remount() {
        let device = Arc::new(MemBlockDevice::new(TOTAL_SECTORS));
        let fs = Filesystem::format(device.clone()).unwrap();
        let file_sector = fs.inode_table().allocate_entry_sector().unwrap();
        fs.inode_table().inode_create(file_sector, 4096, false).unwrap();
        fs.shutdown().unwrap();

        let remounted = Filesystem::mount(device).unwrap();
        // The sectors `format` + the file's own grow consumed must still
        // read back as allocated: a second `allocate` must skip over them.
        let reserved = free_map_sector_count(TOTAL_SECTORS) + 1 /* root */ + 1 /* file inode */;
        let fresh = remounted.freemap.allocate(1).unwrap()[0];
        assert!(fresh >= reserved);
    }

    #[test]
    fn format_twice_on_independent_devices_does_not_collide() {
        let a = Filesystem::format(Arc::new(MemBlockDevice::new(TOTAL_SECTORS))).unwrap();
        let b = Filesystem::format(Arc::new(MemBlockDevice::new(TOTAL_SECTORS))).unwrap();
        assert_eq!(a.root().unwrap().ino(), b.root().unwrap().ino());
    }

    #[test]
    fn formatted_root_resolves_dot_and_dotdot_to_itself() {
        let fs = Filesystem::format(Arc::new(MemBlockDevice::new(TOTAL_SECTORS))).unwrap();
        let root = fs.root().unwrap();
        let dot = crate::directory::open_path(fs.inode_table(), &root, &root, "/.").unwrap();
        let dotdot = crate::directory::open_path(fs.inode_table(), &root, &root, "/..").unwrap();
        assert_eq!(dot.inumber(), root.ino());
        assert_eq!(dotdot.inumber(), root.ino());
        fs.inode_table().inode_close(&dot).unwrap();
        fs.inode_table().inode_close(&dotdot).unwrap();
    }
}
