use thiserror::Error;

/// Failure categories of a conversion run.
///
/// These are wrapped in `anyhow` chains throughout the engine; callers that
/// need to branch on semantics (the CLI exit path, the resume logic, tests)
/// downcast to this type.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Environment unsuitable before any mutation happened.
    #[error("preflight failed: {0}")]
    Preflight(String),

    /// A block-layer operation reported failure.
    #[error("block operation '{op}' failed: {detail}")]
    BlockOp { op: &'static str, detail: String },

    /// A mount precondition was not met.
    #[error("mount busy: {0}")]
    MountBusy(String),

    /// An unmount did not release the mount point after retries.
    #[error("unmount did not release {0}")]
    UnmountStuck(String),

    /// The migration acceptance gate rejected the copied tree.
    /// The source has not been modified.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The partition table was mutated but the kernel's view of the device
    /// did not converge within the bounded wait.
    #[error("kernel view of {0} did not converge after partition table change")]
    KernelViewStale(String),

    /// Three consecutive iterations moved less than 1 MiB and the operator
    /// chose to abort.
    #[error("no migration progress after {0} consecutive iterations")]
    NoProgress(u32),

    /// The operator answered a prompt with cancel/abort.
    #[error("aborted by user")]
    UserAborted,

    /// A termination signal arrived; the journal reflects the last fully
    /// completed step.
    #[error("interrupted")]
    Interrupted,
}
