//! Appstack repository checkout.
//!
//! The fetch is a plain `git` subprocess: clone into `<work_dir>/repo`, pin
//! the branch and revision from the instance metadata, then pull submodules.
//! A deploy key, when present, is written next to the work dir with tight
//! permissions and routed through a `GIT_SSH` wrapper.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use tracing::{debug, info};

/// Everything needed to materialize one checkout.
#[derive(Debug, Clone)]
pub struct CheckoutSpec {
    pub url: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub key_material: Option<String>,
}

pub trait RepoFetcher {
    /// Clone the repository into `<work_dir>/repo` and return that path.
    fn fetch(&self, spec: &CheckoutSpec, work_dir: &Path) -> anyhow::Result<PathBuf>;
}

pub struct GitFetcher;

impl RepoFetcher for GitFetcher {
    fn fetch(&self, spec: &CheckoutSpec, work_dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("creating work dir {}", work_dir.display()))?;
        let repo_dir = work_dir.join("repo");

        let git_ssh = match &spec.key_material {
            Some(material) => Some(write_deploy_key(work_dir, material)?),
            None => None,
        };
        let git_ssh = git_ssh.as_deref();

        info!("cloning {} into {}", spec.url, repo_dir.display());
        git(&["clone", spec.url.trim(), "repo"], work_dir, git_ssh)?;
        if let Some(branch) = &spec.branch {
            git(&["checkout", branch], &repo_dir, git_ssh)?;
        }
        if let Some(revision) = &spec.revision {
            git(&["checkout", revision], &repo_dir, git_ssh)?;
        }
        git(
            &["submodule", "update", "--recursive", "--init"],
            &repo_dir,
            git_ssh,
        )?;

        Ok(repo_dir)
    }
}

fn git(args: &[&str], cwd: &Path, git_ssh: Option<&Path>) -> anyhow::Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(wrapper) = git_ssh {
        cmd.env("GIT_SSH", wrapper);
    }
    let output = cmd
        .output()
        .with_context(|| format!("running git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!("git {} ok", args.join(" "));
    Ok(())
}

/// Write the deploy key and a GIT_SSH wrapper that uses it. Returns the
/// wrapper path.
fn write_deploy_key(work_dir: &Path, material: &str) -> anyhow::Result<PathBuf> {
    let key_path = work_dir.join(".deploy_key");
    fs::write(&key_path, material)
        .with_context(|| format!("writing deploy key {}", key_path.display()))?;
    set_mode(&key_path, 0o600)?;

    let wrapper = work_dir.join(".git-ssh.sh");
    fs::write(
        &wrapper,
        format!(
            "#!/bin/sh\nexec ssh -o StrictHostKeyChecking=no -i \"{}\" \"$@\"\n",
            key_path.display()
        ),
    )
    .with_context(|| format!("writing ssh wrapper {}", wrapper.display()))?;
    set_mode(&wrapper, 0o700)?;
    Ok(wrapper)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}
