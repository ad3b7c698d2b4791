//! Snapshot envelopes
//!
//! Backends produce opaque snapshot bytes. Before handing them to the caller
//! the context seals them in an envelope that records which backend produced
//! them and a blake3 digest, so that foreign, truncated or altered bytes are
//! rejected before they ever reach a backend's `restore`.
//!
//! Layout: `"TTHR" | version: u8 | name_len: u16 BE | backend name | digest: [u8; 32] | payload`

use super::error::{SnapshotError, SnapshotResult};

const MAGIC: &[u8; 4] = b"TTHR";
const FORMAT_VERSION: u8 = 1;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + 2;

/// Backend snapshot bytes tagged with their origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEnvelope {
    /// Backend that produced the payload.
    pub backend: String,
    /// Opaque backend bytes.
    pub payload: Vec<u8>,
}

impl SnapshotEnvelope {
    /// Wrap backend bytes.
    pub fn new(backend: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            backend: backend.into(),
            payload,
        }
    }

    /// Serialize to the sealed byte layout.
    pub fn encode(&self) -> SnapshotResult<Vec<u8>> {
        let name = self.backend.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            SnapshotError::CaptureFailed(format!(
                "backend name is too long ({} bytes)",
                name.len()
            ))
        })?;

        let mut out =
            Vec::with_capacity(HEADER_LEN + name.len() + DIGEST_LEN + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(digest(name, &self.payload).as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse and verify sealed bytes.
    pub fn decode(bytes: &[u8]) -> SnapshotResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::Malformed(format!(
                "snapshot is too short ({} bytes)",
                bytes.len()
            )));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(SnapshotError::Malformed("missing snapshot magic".into()));
        }
        let version = bytes[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(SnapshotError::Malformed(format!(
                "unsupported snapshot format version {version}"
            )));
        }

        let name_len =
            u16::from_be_bytes([bytes[MAGIC.len() + 1], bytes[MAGIC.len() + 2]]) as usize;
        let name_end = HEADER_LEN + name_len;
        let digest_end = name_end + DIGEST_LEN;
        if bytes.len() < digest_end {
            return Err(SnapshotError::Malformed("snapshot header is truncated".into()));
        }

        let name = &bytes[HEADER_LEN..name_end];
        let recorded = &bytes[name_end..digest_end];
        let payload = &bytes[digest_end..];
        if digest(name, payload).as_bytes().as_slice() != recorded {
            return Err(SnapshotError::Malformed("snapshot checksum mismatch".into()));
        }

        let backend = std::str::from_utf8(name)
            .map_err(|_| SnapshotError::Malformed("backend name is not UTF-8".into()))?
            .to_owned();

        Ok(Self {
            backend,
            payload: payload.to_vec(),
        })
    }

    /// Reject envelopes produced by another backend.
    pub fn verify_backend(&self, expected: &str) -> SnapshotResult<()> {
        if self.backend == expected {
            Ok(())
        } else {
            Err(SnapshotError::BackendMismatch {
                expected: expected.to_owned(),
                found: self.backend.clone(),
            })
        }
    }
}

fn digest(name: &[u8], payload: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name);
    hasher.update(payload);
    hasher.finalize()
}
