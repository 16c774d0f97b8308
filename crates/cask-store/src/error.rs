use crate::fingerprint::Fingerprint;

/// Domain errors surfaced by the store.
///
/// I/O and SQL failures are not wrapped into these variants; they propagate
/// unchanged so callers can tell environmental trouble apart from protocol
/// violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no pending build exists for key {key}")]
    NotPending { key: Fingerprint },
    #[error("a build is already pending for key {key}")]
    AlreadyPending { key: Fingerprint },
    #[error("key {key} already resolves to a completed item")]
    AlreadyComplete { key: Fingerprint },
    #[error("completion link for key {key} has an invalid target ({target})")]
    CorruptedLink { key: Fingerprint, target: String },
    #[error("construction failed for key {key}")]
    FailedToConstruct { key: Fingerprint },
    #[error("malformed fingerprint '{text}'")]
    MalformedFingerprint { text: String },
}
