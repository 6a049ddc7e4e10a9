use branchfs_core::{Checkout, Error, Result, WorktreeProvisioner, SIDECAR_DIR};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// Checkout fake that writes a small tree and counts invocations.
///
/// A short sleep widens the provisioning window so racing callers
/// actually overlap.
struct FakeCheckout {
    invocations: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl FakeCheckout {
    fn succeeding() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            fail: true,
        }
    }

    fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Checkout for FakeCheckout {
    fn checkout(&self, _repo_root: &Path, branch: &str, dest: &Path) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);

        if self.fail {
            // Leave a partial directory behind, as a real tool might;
            // the provisioner must clean it up.
            fs::create_dir_all(dest)?;
            fs::write(dest.join("half-written"), b"")?;
            return Err(Error::ProvisioningFailed {
                branch: branch.to_string(),
                reason: "corrupt ref".to_string(),
            });
        }

        fs::create_dir_all(dest.join("src"))?;
        fs::write(dest.join("README.md"), "# checked out\n")?;
        Ok(())
    }
}

fn provisioner(
    tmp: &tempfile::TempDir,
    checkout: FakeCheckout,
) -> Arc<WorktreeProvisioner<FakeCheckout>> {
    let repo = tmp.path().join("repo");
    fs::create_dir(&repo).unwrap();
    Arc::new(WorktreeProvisioner::with_checkout(&repo, checkout))
}

#[test]
fn worktree_lands_in_sibling_staging_dir() {
    let tmp = tempfile::TempDir::new().unwrap();
    let provisioner = provisioner(&tmp, FakeCheckout::succeeding());

    let root = provisioner.ensure_worktree("main").unwrap();
    assert_eq!(root, tmp.path().join("tmp").join("main"));
    assert!(root.join("README.md").exists());
}

#[test]
fn provisioning_stamps_sidecar_and_ignore_entry() {
    let tmp = tempfile::TempDir::new().unwrap();
    let provisioner = provisioner(&tmp, FakeCheckout::succeeding());

    let root = provisioner.ensure_worktree("main").unwrap();
    assert!(root.join(SIDECAR_DIR).is_dir());

    let ignore = fs::read_to_string(root.join(".gitignore")).unwrap();
    assert!(ignore.lines().any(|l| l == format!("{}/", SIDECAR_DIR)));
}

#[test]
fn ignore_entry_is_appended_to_existing_rules() {
    struct CheckoutWithIgnore;
    impl Checkout for CheckoutWithIgnore {
        fn checkout(&self, _repo: &Path, _branch: &str, dest: &Path) -> Result<()> {
            fs::create_dir_all(dest)?;
            fs::write(dest.join(".gitignore"), "target/\n")?;
            Ok(())
        }
    }

    let tmp = tempfile::TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    fs::create_dir(&repo).unwrap();
    let provisioner = WorktreeProvisioner::with_checkout(&repo, CheckoutWithIgnore);

    let root = provisioner.ensure_worktree("main").unwrap();
    let ignore = fs::read_to_string(root.join(".gitignore")).unwrap();
    let sidecar_line = format!("{}/", SIDECAR_DIR);
    let lines: Vec<&str> = ignore.lines().collect();
    assert_eq!(lines, vec!["target/", sidecar_line.as_str()]);
}

#[test]
fn second_call_is_idempotent_and_invokes_nothing() {
    let tmp = tempfile::TempDir::new().unwrap();
    let provisioner = provisioner(&tmp, FakeCheckout::succeeding());

    let first = provisioner.ensure_worktree("main").unwrap();
    let second = provisioner.ensure_worktree("main").unwrap();

    assert_eq!(first, second);
    assert_eq!(provisioner.checkout().count(), 1);
}

#[test]
fn concurrent_first_touches_invoke_exactly_one_checkout() {
    let tmp = tempfile::TempDir::new().unwrap();
    let provisioner = provisioner(&tmp, FakeCheckout::succeeding());

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();

    for _ in 0..threads {
        let provisioner = Arc::clone(&provisioner);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            provisioner.ensure_worktree("feature-1")
        }));
    }

    let roots: Vec<PathBuf> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(provisioner.checkout().count(), 1);
    assert!(roots.iter().all(|r| r == &roots[0]));
}

#[test]
fn concurrent_callers_all_observe_a_failed_checkout() {
    let tmp = tempfile::TempDir::new().unwrap();
    let provisioner = provisioner(&tmp, FakeCheckout::failing());

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();

    for _ in 0..threads {
        let provisioner = Arc::clone(&provisioner);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            provisioner.ensure_worktree("broken")
        }));
    }

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed { .. }));
    }

    // One attempt for the whole race; waiters report the winner's
    // outcome instead of running their own checkout.
    assert_eq!(provisioner.checkout().count(), 1);
    assert!(!provisioner.worktree_root("broken").exists());
}

#[test]
fn failed_checkout_leaves_no_partial_tree_and_allows_retry() {
    let tmp = tempfile::TempDir::new().unwrap();
    let provisioner = provisioner(&tmp, FakeCheckout::failing());

    let err = provisioner.ensure_worktree("broken").unwrap_err();
    assert!(matches!(err, Error::ProvisioningFailed { .. }));
    assert!(!provisioner.worktree_root("broken").exists());

    // A later request starts a fresh attempt.
    let _ = provisioner.ensure_worktree("broken").unwrap_err();
    assert_eq!(provisioner.checkout().count(), 2);
}

#[test]
fn failure_on_one_branch_does_not_affect_another() {
    struct SelectiveCheckout;
    impl Checkout for SelectiveCheckout {
        fn checkout(&self, _repo: &Path, branch: &str, dest: &Path) -> Result<()> {
            if branch == "broken" {
                return Err(Error::ProvisioningFailed {
                    branch: branch.to_string(),
                    reason: "corrupt ref".to_string(),
                });
            }
            fs::create_dir_all(dest)?;
            Ok(())
        }
    }

    let tmp = tempfile::TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    fs::create_dir(&repo).unwrap();
    let provisioner = WorktreeProvisioner::with_checkout(&repo, SelectiveCheckout);

    assert!(provisioner.ensure_worktree("broken").is_err());
    assert!(provisioner.ensure_worktree("main").is_ok());
}

/// End-to-end provisioning against the real `git` binary.
mod git_integration {
    use super::*;
    use std::process::Command;

    fn git(repo: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap_or_else(|e| panic!("failed to run `git {:?}`: {}", args, e));
        assert!(
            output.status.success(),
            "`git {:?}` failed:\n{}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo_with_branches(repo: &Path) {
        fs::create_dir_all(repo).unwrap();
        git(repo, &["init"]);
        git(repo, &["config", "user.email", "test@test.com"]);
        git(repo, &["config", "user.name", "Test User"]);
        git(repo, &["config", "commit.gpgsign", "false"]);
        fs::write(repo.join("README.md"), "# Test\n").unwrap();
        git(repo, &["add", "."]);
        git(repo, &["commit", "-m", "initial"]);
        git(repo, &["branch", "-M", "main"]);
        git(repo, &["branch", "feature-1"]);
    }

    #[test]
    fn git_worktree_add_materializes_the_branch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        init_repo_with_branches(&repo);

        let provisioner = WorktreeProvisioner::new(&repo);
        let root = provisioner.ensure_worktree("feature-1").unwrap();

        assert_eq!(root, tmp.path().join("tmp").join("feature-1"));
        assert!(root.join("README.md").exists());
        assert!(root.join(SIDECAR_DIR).is_dir());
        let ignore = fs::read_to_string(root.join(".gitignore")).unwrap();
        assert!(ignore.contains(SIDECAR_DIR));
    }

    #[test]
    fn checkout_of_a_missing_branch_fails_cleanly() {
        let tmp = tempfile::TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        init_repo_with_branches(&repo);

        let provisioner = WorktreeProvisioner::new(&repo);
        let err = provisioner.ensure_worktree("no-such-branch").unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed { .. }));
        assert!(!provisioner.worktree_root("no-such-branch").exists());
    }
}
