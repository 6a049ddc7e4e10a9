use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Name of the sidecar metadata directory created inside each worktree.
pub const SIDECAR_DIR: &str = "META";

/// Sibling directory of the repository that holds all worktrees.
const STAGING_DIR: &str = "tmp";

/// External checkout invocation, scoped to one branch.
///
/// Abstracted so the provisioner's at-most-once guarantee can be
/// exercised against a counting fake; production code uses
/// [`GitCheckout`].
pub trait Checkout: Send + Sync {
    /// Materialize `branch` of the repository at `repo_root` into `dest`.
    ///
    /// The repository root is passed to the child process explicitly;
    /// implementations must not mutate the process working directory.
    fn checkout(&self, repo_root: &Path, branch: &str, dest: &Path) -> Result<()>;
}

/// Checkout via `git worktree add`.
#[derive(Debug, Default)]
pub struct GitCheckout;

impl Checkout for GitCheckout {
    fn checkout(&self, repo_root: &Path, branch: &str, dest: &Path) -> Result<()> {
        let output = Command::new("git")
            .arg("worktree")
            .arg("add")
            .arg(dest)
            .arg(branch)
            .current_dir(repo_root)
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ProvisioningFailed {
                branch: branch.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Per-branch provisioning gate.
///
/// `attempts` counts completed provisioning attempts; a caller that
/// snapshots it before blocking on `slot` can tell whether another
/// caller ran an attempt while it waited. `slot` holds the failure
/// reason of the most recent attempt, `None` after success.
#[derive(Default)]
struct BranchGate {
    attempts: AtomicU64,
    slot: Mutex<Option<String>>,
}

/// Guarantees a branch's working tree exists on disk before it is used.
///
/// Worktrees for branch `B` of the repository at `R` live at
/// `parent(R)/tmp/B`. Provisioning is idempotent and effective at most
/// once per branch: the existence check runs fresh on every call (the
/// directory is the source of truth, it can outlive a remount), the
/// already-provisioned path is lock-free, and first-time provisioning
/// of one branch is serialized behind a per-branch lock so concurrent
/// first touches trigger exactly one external checkout. A caller that
/// loses the lock race observes the winner's outcome, success or
/// failure, without invoking its own checkout.
pub struct WorktreeProvisioner<C = GitCheckout> {
    repo_root: PathBuf,
    staging_root: PathBuf,
    gates: Mutex<HashMap<String, Arc<BranchGate>>>,
    checkout: C,
}

impl WorktreeProvisioner<GitCheckout> {
    /// Create a provisioner backed by the `git` binary.
    pub fn new<P: AsRef<Path>>(repo_root: P) -> Self {
        Self::with_checkout(repo_root, GitCheckout)
    }
}

impl<C: Checkout> WorktreeProvisioner<C> {
    /// Create a provisioner with a custom checkout implementation.
    pub fn with_checkout<P: AsRef<Path>>(repo_root: P, checkout: C) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        let staging_root = match repo_root.parent() {
            Some(parent) => parent.join(STAGING_DIR),
            None => repo_root.join(STAGING_DIR),
        };

        Self {
            repo_root,
            staging_root,
            gates: Mutex::new(HashMap::new()),
            checkout,
        }
    }

    /// Deterministic worktree root for `branch`, whether or not it has
    /// been provisioned yet.
    pub fn worktree_root(&self, branch: &str) -> PathBuf {
        self.staging_root.join(branch)
    }

    /// Ensure a working tree for `branch` exists, creating it on first
    /// access.
    ///
    /// Returns the worktree root. On a failed checkout no partial
    /// directory is left behind, so a later request may retry.
    pub fn ensure_worktree(&self, branch: &str) -> Result<PathBuf> {
        let root = self.worktree_root(branch);

        // Lock-free fast path: repeated listings of a provisioned
        // branch must not contend on anything.
        if root.exists() {
            return Ok(root);
        }

        let gate = self.branch_gate(branch);
        let attempts_seen = gate.attempts.load(Ordering::Acquire);
        let mut slot = gate.slot.lock().unwrap_or_else(PoisonError::into_inner);

        // Re-check under the lock: the winner of a concurrent first
        // touch has already done the work.
        if root.exists() {
            debug!("worktree for '{}' provisioned by concurrent caller", branch);
            return Ok(root);
        }

        // An attempt completed while we waited and the tree still does
        // not exist, so the winner failed; report its outcome instead
        // of running a second checkout.
        if gate.attempts.load(Ordering::Acquire) > attempts_seen {
            if let Some(reason) = slot.as_ref() {
                return Err(Error::ProvisioningFailed {
                    branch: branch.to_string(),
                    reason: reason.clone(),
                });
            }
        }

        info!(
            "provisioning worktree for '{}' at {}",
            branch,
            root.display()
        );

        let outcome = self.provision(branch, &root);
        gate.attempts.fetch_add(1, Ordering::Release);

        match outcome {
            Ok(()) => {
                *slot = None;
                Ok(root)
            }
            Err(e) => {
                // The path must not appear provisioned after a failure.
                if root.exists() {
                    if let Err(rm) = fs::remove_dir_all(&root) {
                        warn!(
                            "failed to remove partial worktree {}: {}",
                            root.display(),
                            rm
                        );
                    }
                }
                let e = match e {
                    Error::ProvisioningFailed { .. } => e,
                    other => Error::ProvisioningFailed {
                        branch: branch.to_string(),
                        reason: other.to_string(),
                    },
                };
                if let Error::ProvisioningFailed { reason, .. } = &e {
                    *slot = Some(reason.clone());
                }
                Err(e)
            }
        }
    }

    /// Checkout plus sidecar stamping; caller holds the branch gate.
    fn provision(&self, branch: &str, root: &Path) -> Result<()> {
        fs::create_dir_all(&self.staging_root)?;
        self.checkout.checkout(&self.repo_root, branch, root)?;

        fs::create_dir(root.join(SIDECAR_DIR))?;

        // Append, never truncate: the branch may carry its own ignore
        // entries.
        let mut ignore = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(".gitignore"))?;
        writeln!(ignore, "{}/", SIDECAR_DIR)?;

        debug!("worktree for '{}' ready", branch);
        Ok(())
    }

    /// The checkout implementation behind this provisioner.
    pub fn checkout(&self) -> &C {
        &self.checkout
    }

    /// Per-branch gate, created lazily. The map itself is guarded by
    /// one coarse lock, distinct from the per-branch locks it hands
    /// out.
    fn branch_gate(&self, branch: &str) -> Arc<BranchGate> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.entry(branch.to_string()).or_default().clone()
    }
}
