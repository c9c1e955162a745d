use std::path::{Component, Path};

use canload_protocol::constants::MAX_FILENAME_SIZE;

/// A remote file name the store refuses to map onto its directory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid file name {name:?}: {reason}")]
pub struct InvalidName {
    pub name: String,
    pub reason: &'static str,
}

impl InvalidName {
    fn new(name: &str, reason: &'static str) -> Self {
        // Names can be up to MAX_FILENAME_SIZE bytes; keep messages readable.
        let name = if name.len() > 64 {
            let mut end = 64;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &name[..end])
        } else {
            name.to_string()
        };
        Self { name, reason }
    }
}

/// Validates that a remote file name stays inside the store's directory.
///
/// Rejects:
/// - Empty names and names longer than [`MAX_FILENAME_SIZE`] bytes
/// - NUL bytes
/// - Absolute names (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_remote_name(name: &str) -> Result<(), InvalidName> {
    if name.is_empty() {
        return Err(InvalidName::new(name, "empty name"));
    }
    if name.len() > MAX_FILENAME_SIZE {
        return Err(InvalidName::new(name, "name too long"));
    }
    if name.contains('\0') {
        return Err(InvalidName::new(name, "NUL byte in name"));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(InvalidName::new(name, "absolute path not allowed"));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(InvalidName::new(name, "parent directory traversal not allowed"));
            }
            Component::Prefix(_) => {
                return Err(InvalidName::new(name, "path prefix not allowed"));
            }
            Component::RootDir => {
                return Err(InvalidName::new(name, "absolute path not allowed"));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
