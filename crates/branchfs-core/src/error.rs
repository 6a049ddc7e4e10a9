use thiserror::Error;

/// Errors that can occur while resolving virtual paths or provisioning
/// worktrees.
#[derive(Debug, Error)]
pub enum Error {
    /// The external checkout failed or left an unusable tree.
    ///
    /// Local to the requesting branch; other branches and the mount
    /// itself are unaffected.
    #[error("provisioning failed for branch '{branch}': {reason}")]
    ProvisioningFailed { branch: String, reason: String },

    /// The requested operation is not supported by this filesystem.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for branchfs-core operations.
pub type Result<T> = std::result::Result<T, Error>;
