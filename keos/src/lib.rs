//! # keos: the ambient kernel framework
//!
//! This crate provides the small set of primitives that every subsystem
//! built on top of it shares: a single errno-style error type, the
//! synchronization primitives used to protect shared kernel state, the
//! virtual/physical addressing newtypes, a page abstraction, and the trait
//! contracts that stand in for the parts of the embedding OS that are out of
//! scope here (the scheduler, the interrupt dispatcher, the block device
//! driver, the physical-frame allocator).
//!
//! Those external collaborators are deliberately left as traits rather than
//! real hardware-backed implementations: this crate (and anything built on
//! it) is meant to be dropped into a hosting kernel that supplies concrete
//! implementations, the same way the real drivers would.
#![cfg_attr(not(test), no_std)]
#![feature(negative_impls)]

extern crate alloc;

pub mod addressing;
pub mod block;
pub mod fs;
pub mod mm;
pub mod sync;
pub mod util;

/// Errno-style error taxonomy shared by every fallible operation in the
/// kernel subsystems built on this crate.
///
/// Syscall handlers convert a `KernelError` into a negative return value via
/// [`KernelError::into_usize`]; everything below the syscall boundary simply
/// propagates `Result<T, KernelError>` with `?`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File too large to be addressed by the inode index. (EFBIG)
    FileTooLarge,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the error into the negative `usize` a syscall handler
    /// returns to user space (cast through `isize`, matching the x86-64
    /// syscall `%rax` convention).
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::FileTooLarge => -27,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -95,
        }) as usize
    }
}

/// Global compile-time knobs. There is no environment-variable or
/// config-file surface; everything tunable lives here.
pub mod config {
    /// Size of a disk sector, in bytes.
    pub const SECTOR_SIZE: usize = 512;
    /// Number of slots in the buffer cache.
    pub const CACHE_SIZE: usize = 64;
    /// Size of a virtual memory page, in bytes.
    pub const PAGE_SIZE: usize = 4096;
    /// Sectors per page.
    pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;
    /// Maximum length of a single path component, not counting the NUL
    /// terminator.
    pub const NAME_MAX: usize = 14;
    /// Size of the automatic-stack-growth window below `PHYS_BASE`.
    pub const STACK_GROWTH_LIMIT: usize = 8 * 1024 * 1024;
    /// Bytes below `esp` that are still considered a plausible `push`.
    pub const STACK_GROWTH_SLACK: usize = 32;
    /// Top of the user address space; the user stack grows down from here.
    pub const PHYS_BASE: usize = 0xc000_0000;
}

/// Minimal logging facade. Production builds of the embedding kernel wire
/// these into the boot console; the `test` build routes them through
/// `std::eprintln` so `cargo test -- --nocapture` shows them.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::__log("INFO", format_args!($($arg)*))
    };
}

/// See [`info!`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::__log("DEBUG", format_args!($($arg)*))
    };
}

/// See [`info!`].
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::__log("WARN", format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn __log(level: &str, args: core::fmt::Arguments<'_>) {
    #[cfg(test)]
    {
        std::eprintln!("[{level}] {args}");
    }
    #[cfg(not(test))]
    {
        let _ = (level, args);
    }
}
