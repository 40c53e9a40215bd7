//! Path-string helpers shared by the directory and path-resolution layer.
//!
//! These do not touch a filesystem or inode table; they only turn a path
//! string into the sequence of components a resolver walks one directory
//! lookup at a time.

use crate::{KernelError, config::NAME_MAX};
use alloc::vec::Vec;

/// Whether `path` is rooted at the filesystem root.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Splits `path` into its non-empty components, ignoring repeated or
/// trailing slashes (`"/a//b/"` is `["a", "b"]`).
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Splits `path` into the parent directory's components and the final
/// component, for operations (create, unlink, rename) that need to resolve
/// a containing directory separately from the entry name.
///
/// Returns [`KernelError::InvalidArgument`] if `path` has no final
/// component (e.g. `""` or `"/"`).
pub fn split_parent(path: &str) -> Result<(Vec<&str>, &str), KernelError> {
    let mut parts = components(path);
    let entry = parts.pop().ok_or(KernelError::InvalidArgument)?;
    Ok((parts, entry))
}

/// Validates a single path component against the name-length limit and the
/// reserved `.`/`..` forms are left to the caller, since their meaning
/// (current/parent directory) is resolver policy, not a naming rule.
pub fn validate_component(name: &str) -> Result<(), KernelError> {
    if name.is_empty() {
        Err(KernelError::InvalidArgument)
    } else if name.len() > NAME_MAX {
        Err(KernelError::NameTooLong)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_collapses_slashes() {
        assert_eq!(components("/a//b/c/"), alloc::vec!["a", "b", "c"]);
        assert_eq!(components(""), Vec::<&str>::new());
    }

    #[test]
    fn split_parent_separates_final_component() {
        let (parent, entry) = split_parent("/a/b/c").unwrap();
        assert_eq!(parent, alloc::vec!["a", "b"]);
        assert_eq!(entry, "c");
    }

    #[test]
    fn split_parent_rejects_empty_path() {
        assert_eq!(split_parent("/").unwrap_err(), KernelError::InvalidArgument);
        assert_eq!(split_parent("").unwrap_err(), KernelError::InvalidArgument);
    }

    #[test]
    fn validate_component_enforces_name_max() {
        assert!(validate_component("ok").is_ok());
        assert_eq!(
            validate_component(""),
            Err(KernelError::InvalidArgument)
        );
        let long = "a".repeat(NAME_MAX + 1);
        assert_eq!(validate_component(&long), Err(KernelError::NameTooLong));
    }
}
