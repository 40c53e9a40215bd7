//! C3: directories as inodes holding fixed-slot name-to-sector records, and
//! the path resolver that walks them.

use crate::inode::{Inode, InodeTable};
use alloc::{
    borrow::ToOwned,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use keos::{KernelError, config::NAME_MAX, fs as path};

const NAME_FIELD: usize = NAME_MAX + 1;
const RECORD_SIZE: usize = 1 + NAME_FIELD + 4;

struct DirRecord {
    in_use: bool,
    name: String,
    inode_sector: u32,
}

impl DirRecord {
    fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0u8; RECORD_SIZE];
        raw[0] = self.in_use as u8;
        let name_bytes = self.name.as_bytes();
        raw[1..1 + name_bytes.len()].copy_from_slice(name_bytes);
        raw[1 + NAME_FIELD..].copy_from_slice(&self.inode_sector.to_le_bytes());
        raw
    }

    fn from_bytes(raw: &[u8; RECORD_SIZE]) -> Self {
        let in_use = raw[0] != 0;
        let name_raw = &raw[1..1 + NAME_FIELD];
        let len = name_raw.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
        let name = core::str::from_utf8(&name_raw[..len]).unwrap_or("").to_owned();
        let inode_sector = u32::from_le_bytes(raw[1 + NAME_FIELD..].try_into().unwrap());
        DirRecord {
            in_use,
            name,
            inode_sector,
        }
    }
}

/// A directory handle: an open inode whose file data is a flat array of
/// [`DirRecord`]s.
pub struct Directory {
    inode: Arc<Inode>,
}

impl Directory {
    /// Wraps an already-open directory inode.
    pub fn from_inode(inode: Arc<Inode>) -> Self {
        Directory { inode }
    }

    /// The inode number (sector) backing this directory.
    pub fn ino(&self) -> usize {
        self.inode.inumber()
    }

    /// The underlying open inode handle.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Opens a second handle to the same directory, bumping its open count.
    pub fn reopen(&self, table: &InodeTable) -> Result<Directory, KernelError> {
        Ok(Directory {
            inode: table.inode_open(self.ino())?,
        })
    }

    fn read_records(&self) -> Result<Vec<DirRecord>, KernelError> {
        let length = self.inode.length()?;
        let mut raw = alloc::vec![0u8; length];
        self.inode.read_at(&mut raw, 0)?;
        Ok(raw
            .chunks_exact(RECORD_SIZE)
            .map(|c| DirRecord::from_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn write_record_at(&self, idx: usize, record: &DirRecord) -> Result<(), KernelError> {
        self.inode.write_at(&record.to_bytes(), idx * RECORD_SIZE)?;
        Ok(())
    }

    /// Looks up `name`, returning the sector of its inode if present.
    pub fn lookup(&self, name: &str) -> Result<Option<u32>, KernelError> {
        Ok(self
            .read_records()?
            .into_iter()
            .find(|r| r.in_use && r.name == name)
            .map(|r| r.inode_sector))
    }

    /// Links `name` to `inode_sector` in this directory.
    ///
    /// # Errors
    /// Returns [`KernelError::FileExist`] if `name` is already present.
    pub fn add(&self, name: &str, inode_sector: usize) -> Result<(), KernelError> {
        path::validate_component(name)?;
        let records = self.read_records()?;
        if records.iter().any(|r| r.in_use && r.name == name) {
            return Err(KernelError::FileExist);
        }
        let slot = records.iter().position(|r| !r.in_use).unwrap_or(records.len());
        self.write_record_at(
            slot,
            &DirRecord {
                in_use: true,
                name: name.to_string(),
                inode_sector: inode_sector as u32,
            },
        )
    }

    /// Whether this directory contains anything besides `.` and `..`.
    pub fn is_empty_of_entries(&self) -> Result<bool, KernelError> {
        Ok(self
            .read_records()?
            .into_iter()
            .all(|r| !r.in_use || r.name == "." || r.name == ".."))
    }

    /// Unlinks `name`, failing if it denotes a non-empty directory.
    pub fn remove(&self, name: &str, table: &InodeTable) -> Result<(), KernelError> {
        let mut records = self.read_records()?;
        let idx = records
            .iter()
            .position(|r| r.in_use && r.name == name)
            .ok_or(KernelError::NoSuchEntry)?;
        let sector = records[idx].inode_sector as usize;
        let target = table.inode_open(sector)?;
        if target.is_dir()? {
            let target_dir = Directory::from_inode(target.clone());
            if !target_dir.is_empty_of_entries()? {
                table.inode_close(&target)?;
                return Err(KernelError::DirectoryNotEmpty);
            }
        }
        records[idx].in_use = false;
        self.write_record_at(idx, &records[idx])?;
        target.mark_removed();
        table.inode_close(&target)
    }

    /// Lists every live entry except `.` and `..`.
    pub fn readdir(&self) -> Result<Vec<(usize, String)>, KernelError> {
        Ok(self
            .read_records()?
            .into_iter()
            .filter(|r| r.in_use && r.name != "." && r.name != "..")
            .map(|r| (r.inode_sector as usize, r.name))
            .collect())
    }
}

/// Resolves every component of `path` but the last, returning an open
/// handle to the parent directory plus the final component's name.
///
/// Follows spec.md §4.3 exactly: an empty path fails; a leading `/` starts
/// from `root`, otherwise from `cwd`; a path with no tokens resolves to the
/// start directory itself with a final name of `"."`.
fn resolve_parent(
    table: &InodeTable,
    cwd: &Directory,
    root: &Directory,
    full_path: &str,
) -> Result<(Directory, String), KernelError> {
    if full_path.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let mut dir = if path::is_absolute(full_path) {
        root.reopen(table)?
    } else {
        cwd.reopen(table)?
    };
    let tokens = path::components(full_path);
    let Some((last, interior)) = tokens.split_last() else {
        return Ok((dir, ".".to_string()));
    };
    for tok in interior {
        let lookup = dir.lookup(tok);
        let sector = match lookup {
            Ok(Some(s)) => s,
            Ok(None) => {
                table.inode_close(dir.inode())?;
                return Err(KernelError::NoSuchEntry);
            }
            Err(e) => {
                table.inode_close(dir.inode())?;
                return Err(e);
            }
        };
        let next = table.inode_open(sector as usize)?;
        if !next.is_dir()? {
            table.inode_close(dir.inode())?;
            table.inode_close(&next)?;
            return Err(KernelError::NotDirectory);
        }
        table.inode_close(dir.inode())?;
        dir = Directory::from_inode(next);
    }
    Ok((dir, (*last).to_string()))
}

/// Resolves `path` to an open inode handle. Directories and regular files
/// are both returned uniformly; callers check [`Inode::is_dir`].
pub fn open_path(
    table: &InodeTable,
    cwd: &Directory,
    root: &Directory,
    full_path: &str,
) -> Result<Arc<Inode>, KernelError> {
    let (parent, name) = resolve_parent(table, cwd, root, full_path)?;
    let sector = if name == "." {
        Ok(parent.ino())
    } else {
        match parent.lookup(&name) {
            Ok(Some(s)) => Ok(s as usize),
            Ok(None) => Err(KernelError::NoSuchEntry),
            Err(e) => Err(e),
        }
    };
    let result = sector.and_then(|s| table.inode_open(s));
    table.inode_close(parent.inode())?;
    result
}

/// Creates a new entry named by the final component of `full_path`,
/// allocating a fresh inode of the requested type. For directories, also
/// populates `.` and `..`.
pub fn create_path(
    table: &InodeTable,
    cwd: &Directory,
    root: &Directory,
    full_path: &str,
    is_dir: bool,
) -> Result<Arc<Inode>, KernelError> {
    let (parent, name) = resolve_parent(table, cwd, root, full_path)?;
    let outcome = (|| -> Result<Arc<Inode>, KernelError> {
        if name == "." || name == ".." {
            return Err(KernelError::FileExist);
        }
        if parent.lookup(&name)?.is_some() {
            return Err(KernelError::FileExist);
        }
        let sector = table.allocate_entry_sector()?;
        table.inode_create(sector, 0, is_dir)?;
        parent.add(&name, sector)?;
        if is_dir {
            let new_inode = table.inode_open(sector)?;
            let new_dir = Directory::from_inode(new_inode.clone());
            new_dir.add(".", sector)?;
            new_dir.add("..", parent.ino())?;
            table.inode_close(&new_inode)?;
        }
        table.inode_open(sector)
    })();
    table.inode_close(parent.inode())?;
    outcome
}

/// Unlinks the final component of `full_path` from its parent directory.
pub fn remove_path(
    table: &InodeTable,
    cwd: &Directory,
    root: &Directory,
    full_path: &str,
) -> Result<(), KernelError> {
    let (parent, name) = resolve_parent(table, cwd, root, full_path)?;
    let outcome = if name == "." || name == ".." {
        Err(KernelError::InvalidArgument)
    } else {
        parent.remove(&name, table)
    };
    table.inode_close(parent.inode())?;
    outcome
}
