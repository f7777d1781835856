//! Non-architectural failures (spec §7): decoder-emitted malformed blocks,
//! out-of-range save-state tags, lifecycle misuse, and the handful of
//! documented algorithm paths that are deliberately unimplemented rather
//! than silently wrong (spec §9 open questions).
//!
//! These never arise from well-formed guest code; they indicate a bug in
//! the host or in the collaborator wiring, so they are surfaced as `Err`
//! rather than panicking, letting the host decide whether to halt the VM.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InternalError {
    #[error("decoder produced a malformed basic block: {0}")]
    MalformedBlock(&'static str),

    #[error("save-state stream contains an out-of-range segment type tag: {tag}")]
    SnapshotTypeTagOutOfRange { tag: u8 },

    #[error("save-state stream has unsupported format version {found} (expected {expected})")]
    UnsupportedSnapshotVersion { found: u32, expected: u32 },

    #[error("processor lifecycle violation: expected state {expected}, was in {actual}")]
    LifecycleViolation {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unimplemented control-transfer path: {0}")]
    Unimplemented(&'static str),

    #[error("I/O error while reading a save-state stream: {0}")]
    Io(#[from] std::io::Error),
}
