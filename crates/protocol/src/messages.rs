use serde::{Deserialize, Serialize};

use crate::types::Namespace;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Writes one chunk of a remote file.
///
/// `offset` is the number of bytes the remote has already accepted for
/// `filename`. Offset 0 starts the file over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChunkRequest {
    pub filename: String,
    #[serde(with = "base64_bytes")]
    pub chunk: Vec<u8>,
    pub chunksize: u64,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Namespace::is_files")]
    pub namespace: Namespace,
}

/// Reads one chunk of a remote file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadChunkRequest {
    pub filename: String,
    pub chunksize: u64,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Namespace::is_files")]
    pub namespace: Namespace,
}

/// Queries the last completed upload record of a remote file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetailsRequest {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Namespace::is_files")]
    pub namespace: Namespace,
}

/// Loads a model on the remote, with llama.cpp-style arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub args: Vec<String>,
}

/// Base64 serde for byte payloads; JSON has no native bytes type.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
