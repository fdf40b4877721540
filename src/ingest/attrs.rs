//! String-valued attributes attached to the ingestion directory.
//!
//! The subscription bitmask must survive process restarts and be readable by
//! the external producer writing event files. The store is abstract so
//! platforms with native extended attributes can plug them in; the default
//! implementation keeps each attribute in a sidecar dotfile inside the
//! directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Attribute key under which the subscription mask is persisted.
pub const LISTENED_MASK_ATTR: &str = "user.appevent";

/// Get/set string attributes on a directory.
pub trait DirAttributes: Send + Sync {
    fn get(&self, dir: &Path, key: &str) -> io::Result<Option<String>>;
    fn set(&self, dir: &Path, key: &str, value: &str) -> io::Result<()>;
}

/// Sidecar-file attribute store: `<dir>/.<key>` holds the value.
#[derive(Debug, Default, Clone)]
pub struct FileAttributes;

impl FileAttributes {
    fn attr_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!(".{key}"))
    }
}

impl DirAttributes for FileAttributes {
    fn get(&self, dir: &Path, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(Self::attr_path(dir, key)) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, dir: &Path, key: &str, value: &str) -> io::Result<()> {
        fs::write(Self::attr_path(dir, key), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_attribute_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let attrs = FileAttributes;
        assert_eq!(attrs.get(dir.path(), LISTENED_MASK_ATTR).unwrap(), None);
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let attrs = FileAttributes;
        attrs.set(dir.path(), LISTENED_MASK_ATTR, "37").unwrap();
        assert_eq!(
            attrs.get(dir.path(), LISTENED_MASK_ATTR).unwrap().as_deref(),
            Some("37")
        );

        attrs.set(dir.path(), LISTENED_MASK_ATTR, "255").unwrap();
        assert_eq!(
            attrs.get(dir.path(), LISTENED_MASK_ATTR).unwrap().as_deref(),
            Some("255")
        );
    }
}
