use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::host::Host;

/// Errors surfaced by a transport session or while opening one.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed host fields, raised before any network I/O.
    #[error("host validation failed: {0}")]
    Validation(String),

    #[error("failed to connect to {addr}: {detail}")]
    Connect { addr: String, detail: String },

    #[error("ssh key authentication is not implemented")]
    NotImplemented,

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("upload of {path} incomplete: local {local} bytes, remote {remote} bytes")]
    SizeMismatch {
        path: String,
        local: u64,
        remote: u64,
    },
}

/// Captured output of one remote command, demultiplexed line by line.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// One host's command/file channel for the duration of a dispatch or a
/// polling phase. Implementations are never shared across hosts.
#[async_trait]
pub trait Session: Send + Sync {
    /// Runs one command to completion. EOF on both remote streams is the
    /// success terminal state; a blank command is a no-op.
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError>;

    /// Streams a local file into `remote_dir`, replacing any existing file
    /// of the same name. A size mismatch after the transfer is an error
    /// and removes the partial remote file.
    async fn upload_file(&self, local: &Path, remote_dir: &str) -> Result<(), TransportError>;

    /// Streams a remote file to `local`, replacing any existing local file.
    async fn download_file(&self, local: &Path, remote_src: &str) -> Result<(), TransportError>;

    /// Releases the session's resources. Idempotent.
    async fn close(&self);
}

/// Opens sessions. The seam the dispatcher and orchestrator are tested
/// through.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError>;
}
