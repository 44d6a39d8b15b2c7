use std::path::Path;

use tokio::process::Command;

/// A git invocation that did not produce a usable result: non-zero exit,
/// undecodable output, or a spawn failure.
#[derive(Debug)]
pub(crate) struct GitFailure {
    pub command: String,
    pub detail: String,
}

async fn git(current_dir: Option<&Path>, args: &[&str]) -> Result<String, GitFailure> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(dir) = current_dir {
        command.current_dir(dir);
    }
    let rendered = format!("git {}", args.join(" "));
    let output = command.output().await.map_err(|e| GitFailure {
        command: rendered.clone(),
        detail: format!("failed to launch git: {e}"),
    })?;
    if !output.status.success() {
        return Err(GitFailure {
            command: rendered,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) async fn clone(url: &str, branch: &str, target: &Path) -> Result<(), GitFailure> {
    let target = target.to_string_lossy();
    git(None, &["clone", "--branch", branch, "--single-branch", url, &target]).await.map(|_| ())
}

pub(crate) async fn fetch(workdir: &Path, branch: &str) -> Result<(), GitFailure> {
    git(Some(workdir), &["fetch", "--force", "origin", branch]).await.map(|_| ())
}

pub(crate) async fn reset_to_fetched(workdir: &Path) -> Result<(), GitFailure> {
    git(Some(workdir), &["reset", "--hard", "FETCH_HEAD"]).await.map(|_| ())
}

pub(crate) async fn head_revision(workdir: &Path) -> Result<String, GitFailure> {
    git(Some(workdir), &["rev-parse", "HEAD"]).await.map(|out| out.trim().to_string())
}
