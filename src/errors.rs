//! Error taxonomy for the chain daemon.
//!
//! Each variant corresponds to a distinct failure class surfaced by the
//! fetcher, loader, linker, supervisor, or reconciler. Transient conditions
//! (pin-verify, prog-id-resolve) are retried internally before the timeout
//! variants are returned.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    // --- input ---
    #[error("unknown hook kind: {0}")]
    UnknownHook(String),
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    #[error("argument {key} of program {program} is not a string")]
    BadArgument { program: String, key: String },
    #[error("illegal path in archive entry: {0}")]
    IllegalPath(String),

    // --- fetch ---
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("artifact fetch failed with status {status}: {body}")]
    FetchFailed { status: u16, body: String },
    #[error("unknown archive format: {0}")]
    UnknownArchiveFormat(String),
    #[error("archive extraction failed: {0}")]
    ExtractionFailed(String),

    // --- kernel ---
    #[error("loading object {object} failed: {source}")]
    LoadFailed {
        object: PathBuf,
        source: anyhow::Error,
    },
    #[error("entry function {function} not found in {object}")]
    MissingEntryFunction { function: String, object: PathBuf },
    #[error("pinning map {map} at {path} failed: {reason}")]
    PinFailed {
        map: String,
        path: PathBuf,
        reason: String,
    },
    #[error("attaching {name} to {iface} ({direction}) failed: {source}")]
    AttachFailed {
        name: String,
        iface: String,
        direction: String,
        source: anyhow::Error,
    },
    #[error("map lookup on {map} failed: {reason}")]
    MapLookupFailed { map: String, reason: String },
    #[error("map update on {map} failed: {reason}")]
    MapUpdateFailed { map: String, reason: String },

    // --- chain ---
    #[error("pinned map {0} was not created within the verification window")]
    PinVerifyTimeout(PathBuf),
    #[error("program id for {0} did not appear in the previous chain map")]
    ProgIdResolveTimeout(String),
    #[error("stale root map file {0} could not be removed: {1}")]
    StaleRootMap(PathBuf, String),
    #[error("cleanup verification failed for {program}: {reason}")]
    CleanupFailed { program: String, reason: String },

    // --- supervisor ---
    #[error("{0} is not executable")]
    ExecNotExecutable(PathBuf),
    #[error("spawning {command} failed: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stopping external instance of {0} failed: {1}")]
    StopExternalFailed(String, String),

    // --- lifecycle ---
    #[error("program {program} failed to start: {reason}")]
    StartupFailed { program: String, reason: String },
    #[error("program {0} is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for conditions Stop treats as warnings rather than hard failures.
    pub fn is_cleanup_soft(&self) -> bool {
        !matches!(self, Error::PinVerifyTimeout(_) | Error::CleanupFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::BadArgument {
            program: "rate-limiter".into(),
            key: "ports".into(),
        };
        assert!(err.to_string().contains("ports"));
        assert!(err.to_string().contains("rate-limiter"));

        let err = Error::FetchFailed {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_cleanup_soft_classification() {
        assert!(!Error::PinVerifyTimeout(PathBuf::from("/sys/fs/bpf/eth0/m")).is_cleanup_soft());
        assert!(!Error::CleanupFailed {
            program: "p".into(),
            reason: "r".into()
        }
        .is_cleanup_soft());
        assert!(Error::UnknownHook("foo".into()).is_cleanup_soft());
    }
}
