use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use remote::Session;
use report::{CaseInfo, ReportData, Status, Verdict};
use tokio::time::sleep;
use tracing::info;

use crate::batch::{CHECK_PID_FILE, ERROR_FILE, REMOTE_WORK_DIR, RESULT_FILE};

/// Watches every launched host until its inspection process has exited and
/// its marker file has been fetched. A host resolves exactly once. Hosts
/// whose process exited without leaving either marker get a synthesized
/// failure fragment instead of a download; those fragments are returned.
///
/// There is no overall deadline: a host whose process never exits keeps the
/// loop alive indefinitely.
pub(crate) async fn poll_until_resolved(
    tasks: &HashMap<String, Box<dyn Session>>,
    scratch_dir: &Path,
    interval: Duration,
) -> anyhow::Result<Vec<ReportData>> {
    let mut resolved: HashSet<String> = HashSet::new();
    let mut gaps = Vec::new();

    while resolved.len() < tasks.len() {
        sleep(interval).await;
        for (ip, session) in tasks {
            if resolved.contains(ip) {
                continue;
            }
            let probe = format!("sudo ls /proc/`cat {REMOTE_WORK_DIR}/{CHECK_PID_FILE}`/exe");
            let output = session
                .exec(&probe)
                .await
                .with_context(|| format!("failed to probe inspection process on {ip}"))?;
            // A live process lists its exe link; stderr from a stale pid
            // only means the process is gone.
            if !output.stdout.is_empty() {
                continue;
            }

            let listing = session
                .exec(&format!("ls {REMOTE_WORK_DIR}"))
                .await
                .with_context(|| format!("failed to list work directory on {ip}"))?;
            if !listing.stderr.is_empty() {
                anyhow::bail!(
                    "failed to list work directory on {ip}: {}",
                    listing.stderr.join(",")
                );
            }

            let mut marker = None;
            for entry in &listing.stdout {
                match entry.trim() {
                    RESULT_FILE => marker = Some((RESULT_FILE, format!("{ip}.yaml"))),
                    ERROR_FILE => marker = Some((ERROR_FILE, format!("{ip}.errorlog"))),
                    _ => continue,
                }
                break;
            }
            match marker {
                Some((remote_name, local_name)) => {
                    let local = scratch_dir.join(local_name);
                    let remote_src = format!("{REMOTE_WORK_DIR}/{remote_name}");
                    session
                        .download_file(&local, &remote_src)
                        .await
                        .with_context(|| format!("failed to fetch {remote_src} from {ip}"))?;
                    info!(host = %ip, "inspection finished, fetched {remote_name}");
                }
                None => {
                    info!(host = %ip, "inspection exited without leaving a result");
                    gaps.push(missing_result_fragment(ip));
                }
            }
            resolved.insert(ip.clone());
        }
    }
    Ok(gaps)
}

fn missing_result_fragment(ip: &str) -> ReportData {
    ReportData {
        total: 1,
        failure: 1,
        result: Verdict::NotPass,
        cases: vec![CaseInfo {
            identify: "ip".to_string(),
            ip: ip.to_string(),
            role: "node".to_string(),
            name: "collect inspection result".to_string(),
            status: Status::Failure,
            detail: "inspection process exited without writing a result file; \
                     check that the account has passwordless sudo on the host"
                .to_string(),
            duration_time: "0".to_string(),
        }],
        ..ReportData::default()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use remote::{ExecOutput, TransportError};
    use tokio::time::Instant;

    use super::*;

    /// The fault a scripted host injects once its process has exited.
    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        ProbeError,
        ListingStderr,
        DownloadError,
    }

    /// Reports the process alive for a fixed number of probes, then exited
    /// with the given marker file in the work directory.
    struct ScriptedSession {
        cycles_until_exit: u32,
        probes: AtomicU32,
        marker: Option<&'static str>,
        fault: Option<Fault>,
        downloads: Arc<Mutex<Vec<(PathBuf, String)>>>,
    }

    impl ScriptedSession {
        fn new(cycles_until_exit: u32, marker: Option<&'static str>) -> Self {
            Self {
                cycles_until_exit,
                probes: AtomicU32::new(0),
                marker,
                fault: None,
                downloads: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn faulty(fault: Fault) -> Self {
            Self {
                fault: Some(fault),
                ..Self::new(0, Some(RESULT_FILE))
            }
        }
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError> {
            if cmd.contains("/proc/") {
                if self.fault == Some(Fault::ProbeError) {
                    return Err(TransportError::Connect {
                        addr: "10.0.0.1:22".to_string(),
                        detail: "broken pipe".to_string(),
                    });
                }
                let probe = self.probes.fetch_add(1, Ordering::SeqCst);
                if probe < self.cycles_until_exit {
                    return Ok(ExecOutput {
                        stdout: vec!["/proc/42/exe".to_string()],
                        stderr: Vec::new(),
                    });
                }
                return Ok(ExecOutput {
                    stdout: Vec::new(),
                    stderr: vec!["No such file or directory".to_string()],
                });
            }
            if self.fault == Some(Fault::ListingStderr) {
                return Ok(ExecOutput {
                    stdout: Vec::new(),
                    stderr: vec!["ls: cannot access '/tmp/precheck'".to_string()],
                });
            }
            let mut stdout = vec![CHECK_PID_FILE.to_string()];
            if let Some(marker) = self.marker {
                stdout.push(marker.to_string());
            }
            Ok(ExecOutput {
                stdout,
                stderr: Vec::new(),
            })
        }

        async fn upload_file(&self, _: &Path, _: &str) -> Result<(), TransportError> {
            unreachable!("polling never uploads")
        }

        async fn download_file(&self, local: &Path, remote_src: &str) -> Result<(), TransportError> {
            if self.fault == Some(Fault::DownloadError) {
                return Err(TransportError::Io(std::io::Error::other(
                    "sftp channel closed",
                )));
            }
            self.downloads
                .lock()
                .unwrap()
                .push((local.to_path_buf(), remote_src.to_string()));
            Ok(())
        }

        async fn close(&self) {}
    }

    fn fleet(
        entries: Vec<(&str, ScriptedSession)>,
    ) -> HashMap<String, Box<dyn Session>> {
        entries
            .into_iter()
            .map(|(ip, session)| (ip.to_string(), Box::new(session) as Box<dyn Session>))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_after_slowest_host_and_fetches_markers() {
        let tasks = fleet(vec![
            ("10.0.0.1", ScriptedSession::new(0, Some(RESULT_FILE))),
            ("10.0.0.2", ScriptedSession::new(2, Some(ERROR_FILE))),
        ]);
        let started = Instant::now();
        let gaps = poll_until_resolved(&tasks, Path::new("/tmp/report"), Duration::from_secs(15))
            .await
            .unwrap();
        assert!(gaps.is_empty());
        // Host 2 exits on its third probe: three intervals elapse.
        assert_eq!(started.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn download_paths_carry_the_host_ip() {
        let session = ScriptedSession::new(0, Some(RESULT_FILE));
        let downloads = Arc::clone(&session.downloads);
        let tasks = fleet(vec![("10.0.0.1", session)]);
        poll_until_resolved(&tasks, Path::new("/scratch"), Duration::from_secs(15))
            .await
            .unwrap();
        let downloads = downloads.lock().unwrap();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].0, PathBuf::from("/scratch/10.0.0.1.yaml"));
        assert_eq!(downloads[0].1, "/tmp/precheck/result.yaml");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_marker_becomes_a_failure_fragment() {
        let tasks = fleet(vec![("10.0.0.9", ScriptedSession::new(0, None))]);
        let gaps = poll_until_resolved(&tasks, Path::new("/tmp/report"), Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].failure, 1);
        assert_eq!(gaps[0].result, Verdict::NotPass);
        assert_eq!(gaps[0].cases[0].ip, "10.0.0.9");
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_aborts_the_run() {
        let tasks = fleet(vec![("10.0.0.1", ScriptedSession::faulty(Fault::ProbeError))]);
        let err = poll_until_resolved(&tasks, Path::new("/tmp/report"), Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to probe inspection process on 10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn listing_stderr_aborts_the_run() {
        let tasks = fleet(vec![(
            "10.0.0.1",
            ScriptedSession::faulty(Fault::ListingStderr),
        )]);
        let err = poll_until_resolved(&tasks, Path::new("/tmp/report"), Duration::from_secs(15))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("failed to list work directory on 10.0.0.1"));
        assert!(message.contains("cannot access"));
    }

    #[tokio::test(start_paused = true)]
    async fn download_failure_aborts_the_run() {
        let session = ScriptedSession::faulty(Fault::DownloadError);
        let downloads = Arc::clone(&session.downloads);
        let tasks = fleet(vec![("10.0.0.1", session)]);
        let err = poll_until_resolved(&tasks, Path::new("/tmp/report"), Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to fetch /tmp/precheck/result.yaml from 10.0.0.1"));
        assert!(downloads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fleet_resolves_without_sleeping() {
        let tasks: HashMap<String, Box<dyn Session>> = HashMap::new();
        let started = Instant::now();
        let gaps = poll_until_resolved(&tasks, Path::new("/tmp/report"), Duration::from_secs(15))
            .await
            .unwrap();
        assert!(gaps.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
