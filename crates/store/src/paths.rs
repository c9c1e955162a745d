use std::path::{Path, PathBuf};

use canload_protocol::constants::{ANONYMOUS_CALLER, CANISTER_CACHE_DIR};
use canload_protocol::{ApiError, Namespace};
use canload_transfer::validate_remote_name;

use crate::metadata::METADATA_FILE;

/// A remote name mapped onto the store's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolved {
    /// Name as reported back to callers and used as the metadata key.
    pub key: String,
    /// Absolute location on disk.
    pub path: PathBuf,
}

/// Returns `true` for a missing or anonymous caller.
pub(crate) fn is_anonymous(caller: Option<&str>) -> bool {
    match caller {
        None => true,
        Some(c) => c.is_empty() || c == ANONYMOUS_CALLER,
    }
}

/// Maps `name` in `namespace` to a path under `root`.
///
/// Prompt caches live in `.canister_cache/<caller>/sessions/<name>`, so each
/// caller only ever sees its own.
pub(crate) fn resolve(
    root: &Path,
    namespace: Namespace,
    caller: Option<&str>,
    name: &str,
) -> Result<Resolved, ApiError> {
    validate_remote_name(name).map_err(|e| ApiError::Other(e.to_string()))?;

    let key = match namespace {
        Namespace::Files => {
            if name.trim_start_matches("./") == METADATA_FILE {
                return Err(ApiError::Other(format!("{name} is a reserved name")));
            }
            name.to_string()
        }
        Namespace::PromptCache => {
            let caller = match caller {
                Some(c) if !is_anonymous(caller) => c,
                _ => return Err(ApiError::AccessDenied),
            };
            if caller.contains(['/', '\\']) {
                return Err(ApiError::Other(format!("invalid caller {caller:?}")));
            }
            validate_remote_name(caller).map_err(|e| ApiError::Other(e.to_string()))?;
            format!("{CANISTER_CACHE_DIR}/{caller}/sessions/{name}")
        }
    };

    Ok(Resolved {
        path: root.join(&key),
        key,
    })
}
