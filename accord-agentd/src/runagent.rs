//! Runagent control socket
//!
//! A UNIX stream socket that lets local tooling trigger an agent run. Each
//! connection sends one newline-terminated request line; a short-lived task
//! runs the configured command and streams its combined output back.

use accord_core::AccordResult;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const SOCKET_NAME: &str = "runagent.socket";
const REQUEST_LIMIT: usize = 4096;

/// A bound runagent socket; unlinks its path on drop.
pub struct RunagentSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl RunagentSocket {
    /// Bind the socket inside `dir`, creating the directory mode 0750 and
    /// applying access for the configured users.
    pub fn bind(dir: &Path, allow_users: &[String]) -> AccordResult<Self> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(dir)?;

        let path = dir.join(SOCKET_NAME);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        apply_socket_access(&path, allow_users)?;
        tracing::info!(socket = %path.display(), "runagent socket listening");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection; cancel-safe, for use inside `select!`.
    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for RunagentSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(socket = %self.path.display(), error = %e, "socket unlink failed");
            }
        }
    }
}

/// Restrict the socket to its owner and the configured users. Ownership is
/// re-applied on reload when the configured set changes.
pub fn apply_socket_access(path: &Path, allow_users: &[String]) -> AccordResult<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;

    if let Some(user) = allow_users.first() {
        match nix::unistd::User::from_name(user) {
            Ok(Some(user)) => {
                if let Err(e) = nix::unistd::chown(path, Some(user.uid), Some(user.gid)) {
                    tracing::warn!(%user.name, error = %e, "socket chown failed");
                }
            }
            Ok(None) => tracing::warn!(user, "runagent user does not exist"),
            Err(e) => tracing::warn!(user, error = %e, "runagent user lookup failed"),
        }
    }
    Ok(())
}

/// Serve one connection: read the request line, run the command, copy its
/// output back, close.
pub async fn handle_connection(mut stream: UnixStream, run_command: Vec<String>) {
    let mut buf = vec![0u8; REQUEST_LIMIT];
    let mut filled = 0usize;
    loop {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if buf[..filled].contains(&b'\n') || filled == buf.len() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "runagent request read failed");
                return;
            }
        }
    }
    let request = String::from_utf8_lossy(&buf[..filled]);
    let request = request.lines().next().unwrap_or("").trim().to_string();
    tracing::info!(%request, "runagent request");

    let (program, args) = match run_command.split_first() {
        Some(split) => split,
        None => {
            let _ = stream.write_all(b"no run command configured\n").await;
            return;
        }
    };

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await;

    match output {
        Ok(output) => {
            let _ = stream.write_all(&output.stdout).await;
            let _ = stream.write_all(&output.stderr).await;
        }
        Err(e) => {
            tracing::error!(command = %program, error = %e, "runagent command failed to start");
            let _ = stream
                .write_all(format!("run command failed: {}\n", e).as_bytes())
                .await;
        }
    }
    let _ = stream.shutdown().await;
}
