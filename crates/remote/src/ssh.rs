use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::host::{Credential, Host};
use crate::transport::{Connect, ExecOutput, Session, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens password-authenticated SSH sessions with an SFTP channel layered
/// on the same transport.
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

struct Inner {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
    closed: bool,
}

/// libssh2 is blocking, so every operation hops onto the blocking pool and
/// locks the underlying session for its duration.
pub struct SshSession {
    inner: Arc<Mutex<Inner>>,
    addr: String,
}

#[async_trait]
impl Connect for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError> {
        host.validate()?;
        let (user, password) = match host.credential() {
            Credential::Password { user, password } => (user, password),
            Credential::KeyFile(_) => return Err(TransportError::NotImplemented),
        };
        let addr = host.dial_addr();
        let dial = addr.clone();
        let inner = blocking(move || open_session(&dial, &user, &password)).await?;
        debug!(addr = %addr, "ssh session established");
        Ok(Box::new(SshSession {
            inner: Arc::new(Mutex::new(inner)),
            addr,
        }))
    }
}

fn open_session(addr: &str, user: &str, password: &str) -> Result<Inner, TransportError> {
    let connect_err = |detail: String| TransportError::Connect {
        addr: addr.to_string(),
        detail,
    };
    let socket = addr
        .to_socket_addrs()
        .map_err(|err| connect_err(format!("failed to resolve address: {err}")))?
        .next()
        .ok_or_else(|| connect_err("no resolved socket address".to_string()))?;
    let tcp = TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT)
        .map_err(|err| connect_err(format!("tcp connect failed: {err}")))?;

    let mut session =
        ssh2::Session::new().map_err(|err| connect_err(format!("session init failed: {err}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| connect_err(format!("handshake failed: {err}")))?;
    session
        .userauth_password(user, password)
        .map_err(|err| connect_err(format!("password authentication failed: {err}")))?;
    if !session.authenticated() {
        return Err(connect_err(
            "authentication was rejected by the server".to_string(),
        ));
    }
    let sftp = session
        .sftp()
        .map_err(|err| connect_err(format!("failed to open sftp channel: {err}")))?;
    Ok(Inner {
        session,
        sftp,
        closed: false,
    })
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError> {
        if cmd.is_empty() {
            return Ok(ExecOutput::default());
        }
        let inner = Arc::clone(&self.inner);
        let cmd = cmd.to_string();
        blocking(move || {
            let guard = inner.lock().unwrap_or_else(|poison| poison.into_inner());
            exec_blocking(&guard, &cmd)
        })
        .await
    }

    async fn upload_file(&self, local: &Path, remote_dir: &str) -> Result<(), TransportError> {
        let inner = Arc::clone(&self.inner);
        let local = local.to_path_buf();
        let remote_dir = remote_dir.to_string();
        blocking(move || {
            let guard = inner.lock().unwrap_or_else(|poison| poison.into_inner());
            upload_blocking(&guard, &local, &remote_dir)
        })
        .await
    }

    async fn download_file(&self, local: &Path, remote_src: &str) -> Result<(), TransportError> {
        let inner = Arc::clone(&self.inner);
        let local = local.to_path_buf();
        let remote_src = remote_src.to_string();
        blocking(move || {
            let guard = inner.lock().unwrap_or_else(|poison| poison.into_inner());
            download_blocking(&guard, &local, &remote_src)
        })
        .await
    }

    async fn close(&self) {
        let inner = Arc::clone(&self.inner);
        let addr = self.addr.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().unwrap_or_else(|poison| poison.into_inner());
            if !guard.closed {
                guard.closed = true;
                let _ = guard.session.disconnect(None, "session finished", None);
                debug!(addr = %addr, "ssh session closed");
            }
        })
        .await;
    }
}

fn exec_blocking(inner: &Inner, cmd: &str) -> Result<ExecOutput, TransportError> {
    let mut channel = inner.session.channel_session()?;
    channel.exec(cmd)?;

    let mut output = ExecOutput::default();
    {
        let stdout = channel.stream(0);
        output.stdout = read_lines(stdout)?;
        let stderr = channel.stderr();
        output.stderr = read_lines(stderr)?;
    }
    // The remote exit status is deliberately not an error here: callers
    // judge a command by its stderr, and the polling probe depends on
    // "gone" commands exiting non-zero with empty output.
    let _ = channel.wait_close();
    Ok(output)
}

fn read_lines(stream: impl Read) -> Result<Vec<String>, TransportError> {
    let mut lines = Vec::new();
    for line in BufReader::new(stream).lines() {
        lines.push(line?);
    }
    Ok(lines)
}

fn upload_blocking(inner: &Inner, local: &Path, remote_dir: &str) -> Result<(), TransportError> {
    let mut local_file = fs::File::open(local)?;
    let remote_path = remote_file_path(local, remote_dir);

    // Creating over an existing remote file can fail, so any previous copy
    // is removed first; "not found" is fine.
    let _ = inner.sftp.unlink(&remote_path);
    let mut remote_file = inner.sftp.create(&remote_path)?;
    std::io::copy(&mut local_file, &mut remote_file)?;

    let remote_size = remote_file.stat()?.size.unwrap_or(0);
    let local_size = local_file.metadata()?.len();
    if remote_size != local_size {
        let _ = inner.sftp.unlink(&remote_path);
        return Err(TransportError::SizeMismatch {
            path: remote_path.display().to_string(),
            local: local_size,
            remote: remote_size,
        });
    }
    Ok(())
}

fn download_blocking(inner: &Inner, local: &Path, remote_src: &str) -> Result<(), TransportError> {
    let mut remote_file = inner.sftp.open(Path::new(remote_src))?;
    let _ = fs::remove_file(local);
    let mut local_file = fs::File::create(local)?;
    std::io::copy(&mut remote_file, &mut local_file)?;
    Ok(())
}

fn remote_file_path(local: &Path, remote_dir: &str) -> PathBuf {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    PathBuf::from(format!("{}/{}", remote_dir.trim_end_matches('/'), name))
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, TransportError> + Send + 'static,
) -> Result<T, TransportError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => Err(TransportError::Io(std::io::Error::other(err.to_string()))),
    }
}
