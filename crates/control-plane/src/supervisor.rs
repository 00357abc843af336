use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use common::api::Cipher;

use crate::persistence::write_atomic;

/// Replay-protection history size passed to the engine at launch.
pub const REPLAY_HISTORY: u32 = 10_000;

/// One entry of the engine's key file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineKey {
    pub id: String,
    pub port: u16,
    pub cipher: Cipher,
    pub secret: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot wait on the engine: {0}")]
    Wait(#[source] std::io::Error),
    #[error("engine exited with {status}")]
    Exited { status: std::process::ExitStatus },
    #[error("cannot write {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("cannot signal the engine: {0}")]
    Signal(String),
}

/// Lifecycle seam around the external proxy engine so tests can substitute
/// a fake without spawning a real process.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Launch the engine and block for the life of the child. Launch
    /// failures and non-zero exits are errors; the caller treats them as
    /// fatal and never restarts the child itself.
    async fn start(&self, metrics_port: u16) -> Result<(), EngineError>;

    /// Rewrite the engine's key file. Pure file write, no process
    /// interaction.
    async fn update_config(&self, keys: &[EngineKey]) -> Result<(), EngineError>;

    /// Hot-reload the running engine without dropping connections.
    async fn reconfigure(&self) -> Result<(), EngineError>;

    /// Force-terminate the engine; best effort.
    async fn stop(&self);
}

pub type DynProxyEngine = Arc<dyn ProxyEngine>;

/// Per-OS executable locations for the bundled outline-ss-server builds.
pub fn default_binary_paths() -> HashMap<&'static str, PathBuf> {
    HashMap::from([
        (
            "macos",
            PathBuf::from("third_party/outline-macos-arm64/outline-ss-server"),
        ),
        (
            "linux",
            PathBuf::from("third_party/outline-linux-x86_64/outline-ss-server"),
        ),
    ])
}

/// Supervisor for the bundled outline-ss-server engine.
pub struct OutlineEngine {
    config_path: PathBuf,
    binary_paths: HashMap<&'static str, PathBuf>,
    // Child pid for signal delivery; 0 while no child is running.
    pid: AtomicU32,
}

impl OutlineEngine {
    pub fn new(
        config_path: impl Into<PathBuf>,
        binary_paths: HashMap<&'static str, PathBuf>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            binary_paths,
            pid: AtomicU32::new(0),
        }
    }

    /// The executable for the current platform, falling back to the linux
    /// build when the platform is unmapped.
    fn binary_path(&self) -> Option<&Path> {
        self.binary_paths
            .get(std::env::consts::OS)
            .or_else(|| self.binary_paths.get("linux"))
            .map(PathBuf::as_path)
    }
}

#[async_trait]
impl ProxyEngine for OutlineEngine {
    async fn start(&self, metrics_port: u16) -> Result<(), EngineError> {
        let Some(binary) = self.binary_path() else {
            return Err(EngineError::Launch {
                binary: "<none>".into(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no engine binary configured for this platform",
                ),
            });
        };
        let binary = binary.to_path_buf();

        let mut command = Command::new(&binary);
        command
            .arg("-config")
            .arg(&self.config_path)
            .arg("-metrics")
            .arg(format!("127.0.0.1:{metrics_port}"))
            .arg("--replay_history")
            .arg(REPLAY_HISTORY.to_string())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|source| EngineError::Launch {
            binary: binary.display().to_string(),
            source,
        })?;
        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::SeqCst);
        }
        info!(binary = %binary.display(), metrics_port, "shadowsocks engine started");

        let status = child.wait().await.map_err(EngineError::Wait)?;
        self.pid.store(0, Ordering::SeqCst);

        if !status.success() {
            return Err(EngineError::Exited { status });
        }
        Ok(())
    }

    async fn update_config(&self, keys: &[EngineKey]) -> Result<(), EngineError> {
        #[derive(Serialize)]
        struct EngineConfig<'a> {
            keys: &'a [EngineKey],
        }

        let rendered = serde_yaml::to_string(&EngineConfig { keys }).map_err(|source| {
            EngineError::Config {
                path: self.config_path.clone(),
                source: source.into(),
            }
        })?;
        write_atomic(&self.config_path, rendered.as_bytes()).map_err(|source| {
            EngineError::Config {
                path: self.config_path.clone(),
                source,
            }
        })?;
        debug!(keys = keys.len(), path = %self.config_path.display(), "engine key file rewritten");
        Ok(())
    }

    async fn reconfigure(&self) -> Result<(), EngineError> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(EngineError::Signal("engine is not running".into()));
        }
        info!(pid, "reloading the shadowsocks engine");
        send_sighup(pid)
    }

    async fn stop(&self) {
        let pid = self.pid.swap(0, Ordering::SeqCst);
        if pid == 0 {
            debug!("engine already stopped");
            return;
        }
        match send_sigkill(pid) {
            Ok(()) => info!(pid, "shadowsocks engine terminated"),
            Err(err) => warn!(?err, pid, "cannot terminate the shadowsocks engine"),
        }
    }
}

#[cfg(unix)]
fn send_sighup(pid: u32) -> Result<(), EngineError> {
    // SAFETY: kill(2) on a pid we spawned; no memory is involved.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
    if rc != 0 {
        return Err(EngineError::Signal(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn send_sigkill(pid: u32) -> Result<(), EngineError> {
    // SAFETY: kill(2) on a pid we spawned; no memory is involved.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        return Err(EngineError::Signal(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sighup(_pid: u32) -> Result<(), EngineError> {
    Err(EngineError::Signal(
        "signals are not supported on this platform".into(),
    ))
}

#[cfg(not(unix))]
fn send_sigkill(_pid: u32) -> Result<(), EngineError> {
    Err(EngineError::Signal(
        "signals are not supported on this platform".into(),
    ))
}
