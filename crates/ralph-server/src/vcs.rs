//! Thin async wrapper over `git` and `gh` for the branch → commit → PR →
//! merge part of a story.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[derive(Debug, Clone)]
pub struct Vcs {
    root: PathBuf,
    remote: String,
}

impl Vcs {
    pub fn new(root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            remote: remote.into(),
        }
    }

    /// Check out `branch`, creating it from `base` when it does not exist yet.
    pub async fn checkout_branch(&self, branch: &str, base: &str) -> anyhow::Result<()> {
        if self.git(&["rev-parse", "--verify", "--quiet", branch]).await.is_ok() {
            self.git(&["checkout", branch]).await?;
            return Ok(());
        }
        self.git(&["checkout", "-b", branch, base])
            .await
            .with_context(|| format!("failed to create branch {branch} from {base}"))?;
        Ok(())
    }

    /// True when the working tree has anything to commit.
    pub async fn has_changes(&self) -> anyhow::Result<bool> {
        let out = self.git(&["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    pub async fn commit_all(&self, message: &str) -> anyhow::Result<()> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", message]).await?;
        Ok(())
    }

    pub async fn push(&self, branch: &str) -> anyhow::Result<()> {
        self.git(&["push", "-u", &self.remote, branch])
            .await
            .with_context(|| format!("failed to push branch {branch}"))?;
        Ok(())
    }

    /// Open a PR for `branch` and return its URL. An already open PR for the
    /// branch is reused.
    pub async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<String> {
        let created = self
            .gh(&[
                "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
            ])
            .await;
        match created {
            Ok(out) => pr_url_from(&out).context("gh pr create printed no URL"),
            Err(e) if e.to_string().contains("already exists") => {
                let out = self
                    .gh(&["pr", "view", branch, "--json", "url", "--jq", ".url"])
                    .await?;
                pr_url_from(&out).context("gh pr view printed no URL")
            }
            Err(e) => Err(e),
        }
    }

    /// Squash-merge the PR for `branch` and return the merge commit on base,
    /// when it can be read back.
    pub async fn merge_pr(&self, branch: &str, base: &str) -> anyhow::Result<Option<String>> {
        self.gh(&["pr", "merge", branch, "--squash", "--delete-branch"])
            .await
            .with_context(|| format!("failed to merge PR for {branch}"))?;
        self.git(&["checkout", base]).await?;
        if let Err(e) = self.git(&["pull", "--ff-only", &self.remote, base]).await {
            tracing::warn!("could not fast-forward {base} after merge: {e:#}");
            return Ok(None);
        }
        let sha = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(Some(sha.trim().to_string()))
    }

    async fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        run(&self.root, "git", args).await
    }

    async fn gh(&self, args: &[&str]) -> anyhow::Result<String> {
        run(&self.root, "gh", args).await
    }
}

async fn run(cwd: &Path, program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "{program} {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn pr_url_from(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| l.starts_with("http://") || l.starts_with("https://"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git_repo() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let vcs = Vcs::new(dir.path(), "origin");
        vcs.git(&["init", "-q", "-b", "dev"]).await.unwrap();
        vcs.git(&["config", "user.email", "ralph@example.com"]).await.unwrap();
        vcs.git(&["config", "user.name", "Ralph"]).await.unwrap();
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        vcs.commit_all("init").await.unwrap();
        dir
    }

    #[test]
    fn pr_url_is_last_url_line() {
        let out = "Creating pull request\nWarning: stuff\nhttps://github.com/o/r/pull/12\n";
        assert_eq!(
            pr_url_from(out).as_deref(),
            Some("https://github.com/o/r/pull/12")
        );
        assert_eq!(pr_url_from("nothing here"), None);
    }

    #[tokio::test]
    async fn branch_commit_cycle() {
        if which_git().is_none() {
            return;
        }
        let dir = git_repo().await;
        let vcs = Vcs::new(dir.path(), "origin");

        vcs.checkout_branch("feat/story-1.1.1", "dev").await.unwrap();
        assert!(!vcs.has_changes().await.unwrap());

        std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        assert!(vcs.has_changes().await.unwrap());
        vcs.commit_all("feat(1.1.1): add a").await.unwrap();
        assert!(!vcs.has_changes().await.unwrap());

        // Checking out an existing branch does not recreate it.
        vcs.checkout_branch("dev", "dev").await.unwrap();
        vcs.checkout_branch("feat/story-1.1.1", "dev").await.unwrap();
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        if which_git().is_none() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let err = run(dir.path(), "git", &["log"]).await.unwrap_err();
        assert!(err.to_string().starts_with("git log failed"));
    }

    fn which_git() -> Option<()> {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|_| ())
    }
}
