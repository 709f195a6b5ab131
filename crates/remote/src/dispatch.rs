use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::command::Command;
use crate::host::Host;
use crate::transport::Connect;

/// Host IP to the ordered diagnostics that host produced. An absent key
/// means the host completed with zero diagnostics.
pub type DispatchResult = HashMap<String, Vec<String>>;

/// Extra attempts after a first failed upload, with a pause in between.
const UPLOAD_RETRY_ATTEMPTS: u32 = 3;
const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Messages a host worker sends to the controller. Every `Diagnostic` for
/// a host is sent before its `Finished`, so the controller can merge first
/// and count second without racing.
enum WorkerEvent {
    Diagnostic { ip: String, message: String },
    Finished,
}

/// Fans `command` out to every host in parallel, one worker per host, and
/// fans partial failures back in. One host's failure never aborts another
/// host's work, and the call returns only once every worker has finished.
pub async fn dispatch(
    connector: Arc<dyn Connect>,
    hosts: &[Host],
    command: &Command,
) -> DispatchResult {
    let mut result = DispatchResult::new();
    if hosts.is_empty() {
        return result;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    for host in hosts {
        tokio::spawn(run_host(
            Arc::clone(&connector),
            host.clone(),
            command.clone(),
            tx.clone(),
        ));
    }
    drop(tx);

    let mut finished = 0;
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Diagnostic { ip, message } => {
                result.entry(ip).or_default().push(message);
            }
            WorkerEvent::Finished => {
                finished += 1;
                if finished == hosts.len() {
                    break;
                }
            }
        }
    }
    result
}

async fn run_host(
    connector: Arc<dyn Connect>,
    host: Host,
    command: Command,
    tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let ip = host.ip.clone();
    let diagnostic = |message: String| {
        let _ = tx.send(WorkerEvent::Diagnostic {
            ip: ip.clone(),
            message,
        });
    };

    let session = match connector.connect(&host).await {
        Ok(session) => session,
        Err(err) => {
            warn!(host = %ip, error = %err, "failed to open remote session");
            diagnostic(err.to_string());
            let _ = tx.send(WorkerEvent::Finished);
            return;
        }
    };

    for upload in &command.uploads {
        let mut outcome = session.upload_file(&upload.src, &upload.dst).await;
        if let Err(ref err) = outcome {
            warn!(
                host = %ip,
                file = %upload.src.display(),
                error = %err,
                "upload failed, retrying"
            );
            for attempt in 1..=UPLOAD_RETRY_ATTEMPTS {
                info!(host = %ip, attempt, "waiting before upload retry");
                tokio::time::sleep(UPLOAD_RETRY_DELAY).await;
                outcome = session.upload_file(&upload.src, &upload.dst).await;
                if outcome.is_ok() {
                    break;
                }
            }
        }
        match outcome {
            Ok(()) => {
                info!(host = %ip, file = %upload.src.display(), dir = %upload.dst, "upload complete");
            }
            // A failed file does not block the remaining, independent files.
            Err(err) => diagnostic(err.to_string()),
        }
    }

    for cmd in &command.commands {
        match session.exec(cmd).await {
            Ok(output) => {
                if output.stderr.is_empty() {
                    info!(host = %ip, command = %cmd, "command complete");
                } else {
                    warn!(host = %ip, command = %cmd, "command produced stderr");
                    for line in output.stderr {
                        diagnostic(line);
                    }
                }
            }
            Err(err) => {
                warn!(host = %ip, command = %cmd, error = %err, "command failed");
                diagnostic(err.to_string());
            }
        }
    }

    session.close().await;
    let _ = tx.send(WorkerEvent::Finished);
}
