//! OS collaborator seam.
//!
//! The executor manipulates user accounts, SSH material and helper scripts
//! only through [`SystemOps`], so tests can substitute a recording mock and
//! the real implementation stays in one place.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{AgentError, Result};

/// `useradd` exit code when the account already exists.
pub const USER_ALREADY_EXISTS: i32 = 9;

#[async_trait]
pub trait SystemOps: Send + Sync + 'static {
    /// Create an OS user. Returns the raw tool exit code: 0 created,
    /// [`USER_ALREADY_EXISTS`] pre-existing, anything else is a failure the
    /// caller aborts on.
    async fn create_user(&self, user_name: &str, password: &str, is_admin: bool) -> Result<i32>;

    /// Resolve uid/gid for `user_name`. `None` means the process should keep
    /// the agent's own identity (the root mapping).
    fn lookup_user(&self, user_name: &str) -> Result<Option<(u32, u32)>>;

    /// Write an SSH key file under the user's `~/.ssh` with `mode`, returning
    /// the file path.
    async fn add_ssh_key(
        &self,
        user_name: &str,
        key: &str,
        file_name: &str,
        mode: u32,
    ) -> Result<PathBuf>;

    /// Derive the public key of a private key file via `ssh-keygen -y`.
    async fn derive_public_key(&self, private_key_file: &Path) -> Result<String>;

    /// Append `public_key` to the user's `authorized_keys` (mode 600).
    async fn add_authorized_key(&self, user_name: &str, public_key: &str) -> Result<()>;

    /// Best-effort removal of a key file installed by `add_ssh_key`.
    async fn remove_ssh_key(&self, user_name: &str, file_name: &str);

    /// Best-effort removal of the `authorized_keys` line equal to `public_key`.
    async fn remove_authorized_key(&self, user_name: &str, public_key: &str);

    /// Run a helper script from the configured script directory, returning
    /// its exit code and combined output.
    async fn run_script(&self, script: &str, args: &[String]) -> Result<(i32, String)>;
}

/// Real implementation backed by the usual Linux tooling.
pub struct UnixSystem {
    script_dir: PathBuf,
    home_root: PathBuf,
}

impl UnixSystem {
    pub fn new(script_dir: PathBuf) -> Self {
        Self {
            script_dir,
            home_root: PathBuf::from("/home"),
        }
    }

    fn home_dir(&self, user_name: &str) -> PathBuf {
        if user_name == "root" {
            PathBuf::from("/root")
        } else {
            self.home_root.join(user_name)
        }
    }

    fn ssh_dir(&self, user_name: &str) -> PathBuf {
        self.home_dir(user_name).join(".ssh")
    }

    async fn chown_recursive(&self, user_name: &str, path: &Path) {
        let output = tokio::process::Command::new("chown")
            .arg("-R")
            .arg(format!("{0}:{0}", user_name))
            .arg(path)
            .output()
            .await;
        if let Err(e) = output {
            tracing::warn!(user = user_name, path = %path.display(), error = %e, "chown failed");
        }
    }
}

#[async_trait]
impl SystemOps for UnixSystem {
    async fn create_user(&self, user_name: &str, password: &str, is_admin: bool) -> Result<i32> {
        let output = tokio::process::Command::new("useradd")
            .arg("-m")
            .arg("-s")
            .arg("/bin/bash")
            .arg(user_name)
            .output()
            .await?;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 && code != USER_ALREADY_EXISTS {
            return Ok(code);
        }

        if !password.is_empty() {
            let mut child = tokio::process::Command::new("chpasswd")
                .stdin(std::process::Stdio::piped())
                .spawn()?;
            if let Some(stdin) = child.stdin.as_mut() {
                use tokio::io::AsyncWriteExt;
                stdin
                    .write_all(format!("{}:{}\n", user_name, password).as_bytes())
                    .await?;
            }
            let status = child.wait().await?;
            if !status.success() {
                tracing::warn!(user = user_name, "Setting password failed");
            }
        }

        if is_admin {
            let status = tokio::process::Command::new("usermod")
                .arg("-aG")
                .arg("sudo")
                .arg(user_name)
                .status()
                .await?;
            if !status.success() {
                tracing::warn!(user = user_name, "Adding user to sudo group failed");
            }
        }

        Ok(code)
    }

    fn lookup_user(&self, user_name: &str) -> Result<Option<(u32, u32)>> {
        if user_name == "root" {
            return Ok(None);
        }
        let user = nix::unistd::User::from_name(user_name)
            .map_err(|e| AgentError::Internal(format!("user lookup {}: {}", user_name, e)))?
            .ok_or_else(|| {
                AgentError::ProcessStart(format!("user {} does not exist", user_name))
            })?;
        Ok(Some((user.uid.as_raw(), user.gid.as_raw())))
    }

    async fn add_ssh_key(
        &self,
        user_name: &str,
        key: &str,
        file_name: &str,
        mode: u32,
    ) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(AgentError::Internal(format!("empty key for {}", file_name)));
        }
        let ssh_dir = self.ssh_dir(user_name);
        tokio::fs::create_dir_all(&ssh_dir).await?;
        tokio::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700)).await?;

        let path = ssh_dir.join(file_name);
        let mut body = key.to_string();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        tokio::fs::write(&path, body).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
        self.chown_recursive(user_name, &ssh_dir).await;
        Ok(path)
    }

    async fn derive_public_key(&self, private_key_file: &Path) -> Result<String> {
        let output = tokio::process::Command::new("ssh-keygen")
            .arg("-y")
            .arg("-f")
            .arg(private_key_file)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AgentError::Internal(format!(
                "ssh-keygen -y failed with exit code {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn add_authorized_key(&self, user_name: &str, public_key: &str) -> Result<()> {
        let ssh_dir = self.ssh_dir(user_name);
        tokio::fs::create_dir_all(&ssh_dir).await?;
        let path = ssh_dir.join("authorized_keys");
        let mut body = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(public_key.trim());
        body.push('\n');
        tokio::fs::write(&path, body).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        self.chown_recursive(user_name, &ssh_dir).await;
        Ok(())
    }

    async fn remove_ssh_key(&self, user_name: &str, file_name: &str) {
        let path = self.ssh_dir(user_name).join(file_name);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Removing SSH key failed");
            }
        }
    }

    async fn remove_authorized_key(&self, user_name: &str, public_key: &str) {
        let path = self.ssh_dir(user_name).join("authorized_keys");
        let Ok(body) = tokio::fs::read_to_string(&path).await else {
            return;
        };
        let wanted = public_key.trim();
        let kept: Vec<&str> = body
            .lines()
            .filter(|line| line.trim() != wanted || wanted.is_empty())
            .collect();
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        if let Err(e) = tokio::fs::write(&path, rewritten).await {
            tracing::warn!(path = %path.display(), error = %e, "Rewriting authorized_keys failed");
        }
    }

    async fn run_script(&self, script: &str, args: &[String]) -> Result<(i32, String)> {
        let output = tokio::process::Command::new("/bin/bash")
            .arg(self.script_dir.join(script))
            .args(args)
            .output()
            .await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), combined))
    }
}
