//! The bit-exact on-disk inode record (spec.md §6): one sector, laid out as
//! `u32 is_dir; i32 length; u32 magic; u32 direct[123]; u32 indirect; u32
//! d_indirect;` for exactly 512 bytes.

use keos::{KernelError, config::SECTOR_SIZE};

/// Number of direct data-sector pointers.
pub const DIRECT_COUNT: usize = 123;
/// Number of data-sector pointers reachable through the indirect block.
pub const INDIRECT_COUNT: usize = 128;
/// Number of data-sector pointers reachable through the double-indirect
/// block (128 indirect blocks of 128 pointers each).
pub const DINDIRECT_COUNT: usize = 128 * 128;
/// Fixed identifier stored in every valid [`InodeDisk`] record.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

const IS_DIR_OFF: usize = 0;
const LENGTH_OFF: usize = 4;
const MAGIC_OFF: usize = 8;
const DIRECT_OFF: usize = 12;
const INDIRECT_OFF: usize = DIRECT_OFF + DIRECT_COUNT * 4;
const DINDIRECT_OFF: usize = INDIRECT_OFF + 4;

const _: () = assert!(DINDIRECT_OFF + 4 == SECTOR_SIZE);

/// The in-memory parse of an on-disk inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeDisk {
    pub is_dir: bool,
    pub length: usize,
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    pub d_indirect: u32,
}

impl InodeDisk {
    /// A freshly zero-length record of the given type.
    pub fn empty(is_dir: bool) -> Self {
        InodeDisk {
            is_dir,
            length: 0,
            direct: [0u32; DIRECT_COUNT],
            indirect: 0,
            d_indirect: 0,
        }
    }

    /// Parses a 512-byte sector as an [`InodeDisk`].
    ///
    /// # Errors
    /// Returns [`KernelError::FilesystemCorrupted`] if `magic` does not
    /// match [`INODE_MAGIC`].
    pub fn from_bytes(raw: &[u8; SECTOR_SIZE]) -> Result<Self, KernelError> {
        let magic = read_u32(raw, MAGIC_OFF);
        if magic != INODE_MAGIC {
            return Err(KernelError::FilesystemCorrupted("bad inode magic"));
        }
        let is_dir = read_u32(raw, IS_DIR_OFF) != 0;
        let length = read_i32(raw, LENGTH_OFF) as usize;
        let mut direct = [0u32; DIRECT_COUNT];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_u32(raw, DIRECT_OFF + i * 4);
        }
        let indirect = read_u32(raw, INDIRECT_OFF);
        let d_indirect = read_u32(raw, DINDIRECT_OFF);
        Ok(InodeDisk {
            is_dir,
            length,
            direct,
            indirect,
            d_indirect,
        })
    }

    /// Serializes this record to its 512-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        write_u32(&mut raw, IS_DIR_OFF, self.is_dir as u32);
        write_i32(&mut raw, LENGTH_OFF, self.length as i32);
        write_u32(&mut raw, MAGIC_OFF, INODE_MAGIC);
        for (i, &s) in self.direct.iter().enumerate() {
            write_u32(&mut raw, DIRECT_OFF + i * 4, s);
        }
        write_u32(&mut raw, INDIRECT_OFF, self.indirect);
        write_u32(&mut raw, DINDIRECT_OFF, self.d_indirect);
        raw
    }
}

fn read_u32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(raw[off..off + 4].try_into().unwrap())
}

fn read_i32(raw: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(raw[off..off + 4].try_into().unwrap())
}

fn write_u32(raw: &mut [u8], off: usize, v: u32) {
    raw[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_i32(raw: &mut [u8], off: usize, v: i32) {
    raw[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let mut disk = InodeDisk::empty(true);
        disk.length = 12345;
        disk.direct[0] = 7;
        disk.indirect = 42;
        disk.d_indirect = 99;
        let raw = disk.to_bytes();
        let parsed = InodeDisk::from_bytes(&raw).unwrap();
        assert_eq!(parsed, disk);
    }

    #[test]
    fn rejects_bad_magic() {
        let raw = [0u8; SECTOR_SIZE];
        assert!(matches!(
            InodeDisk::from_bytes(&raw),
            Err(KernelError::FilesystemCorrupted(_))
        ));
    }

    #[test]
    fn layout_matches_spec_field_offsets() {
        assert_eq!(DIRECT_OFF, 12);
        assert_eq!(INDIRECT_OFF, 12 + 123 * 4);
        assert_eq!(DINDIRECT_OFF, INDIRECT_OFF + 4);
    }
}
