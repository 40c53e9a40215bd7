//! Per-process context: the file descriptor table, working directory,
//! supplemental page table, and memory-mapping table a user thread needs
//! to run the syscalls this crate services.

use crate::directory::Directory;
use crate::inode::{Inode, InodeTable};
use crate::mmap::{self, MmapTable};
use crate::vm::{Spt, SwapArea};
use alloc::sync::Arc;
use keos::{
    KernelError,
    addressing::Va,
    mm::{FrameAllocator, VmMapper},
    sync::SpinLock,
};

const MAX_FDS: usize = 128;
const STDIN: usize = 0;
const STDOUT: usize = 1;

enum FdEntry {
    Stdin,
    Stdout,
    File { inode: Arc<Inode>, pos: usize },
}

/// Everything a running process needs from the filesystem and virtual
/// memory subsystems: its descriptor table, its working directory (fixed to
/// the filesystem root at creation time; this crate does not expose
/// `chdir`), its supplemental page table, and its live memory mappings.
pub struct Process {
    inode_table: Arc<InodeTable>,
    root: Directory,
    cwd: Directory,
    fds: SpinLock<[Option<FdEntry>; MAX_FDS]>,
    spt: Spt,
    mmaps: MmapTable,
    /// Serializes this process's entry into the directory/inode layer
    /// (spec.md §5's `file_lock`, outermost in the `file_lock → inode_lock →
    /// cache_lock` ordering), so a path resolution's lookup-then-mutate
    /// steps in `directory::{open_path,create_path,remove_path}` can't
    /// interleave with another one issued by this same process.
    file_lock: SpinLock<()>,
}

impl Process {
    /// Creates a process whose working directory starts at `root`.
    pub fn new(
        inode_table: Arc<InodeTable>,
        root: Directory,
        frames: Arc<dyn FrameAllocator>,
        mapper: Arc<dyn VmMapper>,
        swap: Arc<SwapArea>,
    ) -> Result<Process, KernelError> {
        let cwd = root.reopen(&inode_table)?;
        let mut fds: [Option<FdEntry>; MAX_FDS] = core::array::from_fn(|_| None);
        fds[STDIN] = Some(FdEntry::Stdin);
        fds[STDOUT] = Some(FdEntry::Stdout);
        Ok(Process {
            inode_table,
            root,
            cwd,
            fds: SpinLock::new(fds),
            spt: Spt::new(frames, mapper, swap),
            mmaps: MmapTable::new(),
            file_lock: SpinLock::new(()),
        })
    }

    /// The supplemental page table backing this process's address space.
    pub fn spt(&self) -> &Spt {
        &self.spt
    }

    fn with_fd<R>(&self, fd: usize, f: impl FnOnce(&mut Option<FdEntry>) -> Result<R, KernelError>) -> Result<R, KernelError> {
        if fd >= MAX_FDS {
            return Err(KernelError::BadFileDescriptor);
        }
        let mut fds = self.fds.lock();
        let result = f(&mut fds[fd]);
        fds.unlock();
        result
    }

    /// Opens `path` relative to the working directory, returning a fresh
    /// file descriptor.
    ///
    /// # Errors
    /// Returns [`KernelError::TooManyOpenFile`] if every descriptor slot is
    /// in use.
    pub fn open(&self, path: &str) -> Result<usize, KernelError> {
        let file_lock = self.file_lock.lock();
        let inode = crate::directory::open_path(&self.inode_table, &self.cwd, &self.root, path);
        file_lock.unlock();
        let inode = inode?;
        let mut fds = self.fds.lock();
        let slot = fds.iter().position(|e| e.is_none());
        let result = match slot {
            Some(fd) => {
                fds[fd] = Some(FdEntry::File { inode, pos: 0 });
                Ok(fd)
            }
            None => {
                self.inode_table.inode_close(&inode)?;
                Err(KernelError::TooManyOpenFile)
            }
        };
        fds.unlock();
        result
    }

    /// Closes `fd`, releasing the underlying inode if it denoted a file.
    pub fn close(&self, fd: usize) -> Result<(), KernelError> {
        if fd >= MAX_FDS {
            return Err(KernelError::BadFileDescriptor);
        }
        let mut fds = self.fds.lock();
        let entry = fds[fd].take();
        fds.unlock();
        match entry {
            Some(FdEntry::File { inode, .. }) => self.inode_table.inode_close(&inode),
            Some(_) => Ok(()),
            None => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Reads into `buf` from `fd`'s current position, advancing it.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.with_fd(fd, |entry| match entry {
            Some(FdEntry::File { inode, pos }) => {
                let n = inode.read_at(buf, *pos)?;
                *pos += n;
                Ok(n)
            }
            Some(FdEntry::Stdin) => Err(KernelError::NotSupportedOperation),
            Some(FdEntry::Stdout) => Err(KernelError::BadFileDescriptor),
            None => Err(KernelError::BadFileDescriptor),
        })
    }

    /// Writes `buf` to `fd`'s current position, advancing it.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, KernelError> {
        self.with_fd(fd, |entry| match entry {
            Some(FdEntry::File { inode, pos }) => {
                let n = inode.write_at(buf, *pos)?;
                *pos += n;
                Ok(n)
            }
            Some(FdEntry::Stdout) => Err(KernelError::NotSupportedOperation),
            Some(FdEntry::Stdin) => Err(KernelError::BadFileDescriptor),
            None => Err(KernelError::BadFileDescriptor),
        })
    }

    /// Current length of the file open on `fd`.
    pub fn filesize(&self, fd: usize) -> Result<usize, KernelError> {
        self.with_fd(fd, |entry| match entry {
            Some(FdEntry::File { inode, .. }) => inode.length(),
            _ => Err(KernelError::BadFileDescriptor),
        })
    }

    /// Moves `fd`'s position to `pos`, which may lie past the current
    /// end of file (the next write will grow it to meet the gap).
    pub fn seek(&self, fd: usize, pos: usize) -> Result<(), KernelError> {
        self.with_fd(fd, |entry| match entry {
            Some(FdEntry::File { pos: cur, .. }) => {
                *cur = pos;
                Ok(())
            }
            _ => Err(KernelError::BadFileDescriptor),
        })
    }

    /// Current position of `fd`.
    pub fn tell(&self, fd: usize) -> Result<usize, KernelError> {
        self.with_fd(fd, |entry| match entry {
            Some(FdEntry::File { pos, .. }) => Ok(*pos),
            _ => Err(KernelError::BadFileDescriptor),
        })
    }

    /// Creates a new, empty regular file at `path`.
    pub fn create(&self, path: &str) -> Result<(), KernelError> {
        let file_lock = self.file_lock.lock();
        let inode = crate::directory::create_path(&self.inode_table, &self.cwd, &self.root, path, false);
        file_lock.unlock();
        self.inode_table.inode_close(&inode?)
    }

    /// Unlinks `path`.
    pub fn remove(&self, path: &str) -> Result<(), KernelError> {
        let file_lock = self.file_lock.lock();
        let result = crate::directory::remove_path(&self.inode_table, &self.cwd, &self.root, path);
        file_lock.unlock();
        result
    }

    /// Maps the file open on `fd` into this process's address space at
    /// `addr`. See [`mmap::mmap`].
    pub fn mmap(&self, fd: usize, addr: Va) -> Result<usize, KernelError> {
        let inode = self.with_fd(fd, |entry| match entry {
            Some(FdEntry::File { inode, .. }) => Ok(inode.clone()),
            _ => Err(KernelError::BadFileDescriptor),
        })?;
        mmap::mmap(&self.spt, &self.inode_table, &self.mmaps, &inode, addr)
    }

    /// Unmaps `mapping_id`. See [`mmap::munmap`].
    pub fn munmap(&self, mapping_id: usize) -> Result<(), KernelError> {
        mmap::munmap(&self.spt, &self.inode_table, &self.mmaps, mapping_id)
    }

    /// Tears the process down: closes every open descriptor, destroys the
    /// supplemental page table (releasing every frame and swap slot it
    /// still owns), then releases the working directory and root handles.
    /// Must run in this order: destroying the SPT first would leave mmap'd
    /// file writes unflushed, since that teardown path does not write back.
    pub fn teardown(&self) -> Result<(), KernelError> {
        let mut fds = self.fds.lock();
        let mut taken: [Option<FdEntry>; MAX_FDS] = core::array::from_fn(|_| None);
        core::mem::swap(&mut *fds, &mut taken);
        fds.unlock();
        for entry in taken.into_iter().flatten() {
            if let FdEntry::File { inode, .. } = entry {
                self.inode_table.inode_close(&inode)?;
            }
        }

        self.spt.spt_destroy();

        self.inode_table.inode_close(self.cwd.inode())?;
        self.inode_table.inode_close(self.root.inode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_cache::BufferCache;
    use keos::block::{BitmapFreeMap, MemBlockDevice};
    use keos::config::PAGE_SIZE;
    use keos::mm::test_doubles::{BitmapFrameAllocator, SoftwareVmMapper};

    const TOTAL_SECTORS: usize = 20_000;
    const ROOT_SECTOR: usize = 1;

    fn fixture() -> Process {
        let device = Arc::new(MemBlockDevice::new(TOTAL_SECTORS));
        let cache = Arc::new(BufferCache::new(device));
        let freemap = Arc::new(BitmapFreeMap::new(TOTAL_SECTORS));
        freemap.allocate(ROOT_SECTOR + 1).unwrap();
        let inode_table = Arc::new(InodeTable::new(cache, freemap));
        inode_table.inode_create(ROOT_SECTOR, 0, true).unwrap();
        let root_inode = inode_table.inode_open(ROOT_SECTOR).unwrap();
        let root = Directory::from_inode(root_inode);
        root.add(".", ROOT_SECTOR).unwrap();
        root.add("..", ROOT_SECTOR).unwrap();

        let frames = Arc::new(BitmapFrameAllocator::new(8));
        let mapper = Arc::new(SoftwareVmMapper::new());
        let swap_device = Arc::new(MemBlockDevice::new(PAGE_SIZE / keos::config::SECTOR_SIZE * 8));
        let swap = Arc::new(SwapArea::new(swap_device));
        Process::new(inode_table, root, frames, mapper, swap).unwrap()
    }

    #[test]
    fn create_open_write_read_close_roundtrips() {
        let p = fixture();
        p.create("/greeting").unwrap();
        let fd = p.open("/greeting").unwrap();
        assert_eq!(p.write(fd, b"hi").unwrap(), 2);
        p.seek(fd, 0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(p.read(fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
        assert_eq!(p.tell(fd).unwrap(), 2);
        assert_eq!(p.filesize(fd).unwrap(), 2);
        p.close(fd).unwrap();
    }

    #[test]
    fn reading_a_closed_descriptor_fails() {
        let p = fixture();
        p.create("/f").unwrap();
        let fd = p.open("/f").unwrap();
        p.close(fd).unwrap();
        assert_eq!(p.read(fd, &mut [0u8; 1]).unwrap_err(), KernelError::BadFileDescriptor);
    }

    #[test]
    fn stdio_descriptors_reject_file_style_io() {
        let p = fixture();
        assert_eq!(p.write(STDIN, b"x").unwrap_err(), KernelError::BadFileDescriptor);
        assert_eq!(p.read(STDOUT, &mut [0u8; 1]).unwrap_err(), KernelError::BadFileDescriptor);
        assert_eq!(p.read(STDIN, &mut [0u8; 1]).unwrap_err(), KernelError::NotSupportedOperation);
        assert_eq!(p.write(STDOUT, b"x").unwrap_err(), KernelError::NotSupportedOperation);
    }

    #[test]
    fn teardown_releases_every_open_descriptor() {
        let p = fixture();
        p.create("/f").unwrap();
        let fd = p.open("/f").unwrap();
        let _ = fd;
        p.teardown().unwrap();
    }
}
