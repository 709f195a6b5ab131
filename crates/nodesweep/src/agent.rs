use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use report::{CaseInfo, ReportData, Status, Verdict, TIME_FORMAT};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::batch::{ERROR_FILE, REMOTE_WORK_DIR, RESULT_FILE};
use crate::repo;

const AGENT_CONTAINER: &str = "kubelet";
const AGENT_BINARY: &str = "/usr/bin/kubelet";
const UNIT_PATH: &str = "/etc/systemd/system/kubelet.service";
const CONTROL_SCRIPT: &str = "/etc/kubernetes/kubelet.sh";
const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const UNIT_TEMPLATE: &str = "\
[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/
After=network-online.target
Wants=network-online.target

[Service]
ExecStart=/usr/bin/kubelet {args}
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub(crate) struct AgentResetOptions {
    pub(crate) http_repo: String,
    pub(crate) kube_version: String,
    pub(crate) runtime: String,
    pub(crate) timeout_minutes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Running,
    TimedOut,
}

/// Executes one host command to completion. The seam the restart wait is
/// tested through.
#[async_trait]
trait RunCommand: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], label: &str) -> anyhow::Result<Output>;
}

struct SystemRunner;

#[async_trait]
impl RunCommand for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], label: &str) -> anyhow::Result<Output> {
        run_with_timeout(Command::new(program).args(args), label).await
    }
}

/// Entry point of the remote side. Whatever happens, exactly one marker
/// file is left in the work directory: `result.yaml` on a completed reset,
/// `error.log` when the reset could not run at all.
pub(crate) async fn run(opts: AgentResetOptions) -> anyhow::Result<()> {
    let outcome = reset(&SystemRunner, &opts).await;
    write_outcome(Path::new(REMOTE_WORK_DIR), outcome)
}

/// Migrates the node agent from a container to a systemd service: recover
/// the agent's arguments from the running container, write a unit using
/// them, remove the container, install the requested agent binary, and
/// restart the unit until it reports running or the deadline passes.
async fn reset(runner: &dyn RunCommand, opts: &AgentResetOptions) -> anyhow::Result<CaseInfo> {
    let started = Instant::now();
    let deadline = Duration::from_secs(opts.timeout_minutes * 60);

    let mut args = container_args(runner, &opts.runtime).await;
    if args.is_none() {
        // No running container to copy arguments from; let the platform's
        // control script bring one up first.
        info!("agent container not found, starting it via {CONTROL_SCRIPT}");
        let output = runner
            .run(
                "bash",
                &[CONTROL_SCRIPT, "-a", "start", "-r", &opts.runtime],
                "agent control script",
            )
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "agent control script failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        sleep(Duration::from_secs(5)).await;
        args = container_args(runner, &opts.runtime).await;
    }
    let args = args.context("agent container is not running and could not be started")?;

    let unit = render_unit(&args);
    tokio::fs::write(UNIT_PATH, unit)
        .await
        .with_context(|| format!("failed to write {UNIT_PATH}"))?;

    let output = runner
        .run(&opts.runtime, &["rm", "-f", AGENT_CONTAINER], "remove agent container")
        .await?;
    if !output.status.success() {
        warn!(
            "could not remove agent container: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let binary = format!("kubelet-{}-{}", opts.kube_version, normalized_arch());
    let url = format!("{}{}", opts.http_repo, binary);
    repo::download(&url, Path::new(AGENT_BINARY))
        .await
        .with_context(|| format!("failed to fetch agent binary {binary}"))?;
    runner
        .run("chmod", &["+x", AGENT_BINARY], "mark agent binary executable")
        .await?;

    let state = restart_until_running(runner, deadline).await?;
    let duration = format!("{:?}", started.elapsed());
    Ok(match state {
        ServiceState::Running => CaseInfo {
            identify: "ip".to_string(),
            role: "node".to_string(),
            name: "node agent reset".to_string(),
            status: Status::Success,
            detail: "agent service is running".to_string(),
            duration_time: duration,
            ..CaseInfo::default()
        },
        ServiceState::TimedOut => CaseInfo {
            identify: "ip".to_string(),
            role: "node".to_string(),
            name: "node agent reset".to_string(),
            status: Status::Failure,
            detail: format!(
                "agent service did not reach running within {} minutes",
                opts.timeout_minutes
            ),
            duration_time: duration,
            ..CaseInfo::default()
        },
    })
}

/// The agent's command line as the container runtime recorded it, or None
/// when no such container exists.
async fn container_args(runner: &dyn RunCommand, runtime: &str) -> Option<Vec<String>> {
    let output = runner
        .run(
            runtime,
            &["inspect", "--format", "{{json .Args}}", AGENT_CONTAINER],
            "inspect agent container",
        )
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

fn render_unit(args: &[String]) -> String {
    // The runtime records arguments with their quoting stripped already;
    // any stray quotes would end up literal in the unit file.
    let joined = args.join(" ").replace('"', "");
    UNIT_TEMPLATE.replace("{args}", &joined)
}

fn normalized_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        _ => "amd64",
    }
}

/// Restart, wait a cycle, check, and go again until the unit reports
/// running or the deadline is used up. The deadline is checked before each
/// wait so the loop always terminates.
async fn restart_until_running(
    runner: &dyn RunCommand,
    deadline: Duration,
) -> anyhow::Result<ServiceState> {
    let started = Instant::now();
    loop {
        for (label, args) in [
            ("systemd reload", vec!["daemon-reload"]),
            ("enable agent service", vec!["enable", "--now", "kubelet"]),
            ("restart agent service", vec!["restart", "kubelet"]),
        ] {
            let output = runner.run("systemctl", &args, label).await?;
            if !output.status.success() {
                warn!(
                    "{label} reported: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        loop {
            if started.elapsed() >= deadline {
                return Ok(ServiceState::TimedOut);
            }
            sleep(STATUS_CHECK_INTERVAL).await;
            let output = runner
                .run("systemctl", &["status", "kubelet"], "agent service status")
                .await?;
            let status = String::from_utf8_lossy(&output.stdout);
            if status_indicates_running(&status) {
                return Ok(ServiceState::Running);
            }
            if !output.status.success() {
                // Unit is loaded but stuck; go round and restart it again.
                break;
            }
        }
    }
}

fn status_indicates_running(status: &str) -> bool {
    status.contains("running")
}

/// One finished reset becomes `result.yaml`; a reset that errored out
/// becomes `error.log` with the full error chain. The fleet side keys off
/// which of the two files exists.
fn write_outcome(work_dir: &Path, outcome: anyhow::Result<CaseInfo>) -> anyhow::Result<()> {
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create {}", work_dir.display()))?;
    match outcome {
        Ok(case) => {
            let failure = i64::from(case.status == Status::Failure);
            let data = ReportData {
                start_time: Local::now().format(TIME_FORMAT).to_string(),
                total: 1,
                success: 1 - failure,
                failure,
                result: if failure > 0 {
                    Verdict::NotPass
                } else {
                    Verdict::Pass
                },
                cases: vec![case],
                ..ReportData::default()
            };
            let text = serde_yaml::to_string(&data).context("failed to encode result")?;
            std::fs::write(work_dir.join(RESULT_FILE), text)
                .context("failed to write result file")?;
            Ok(())
        }
        Err(err) => {
            std::fs::write(work_dir.join(ERROR_FILE), format!("{err:#}\n"))
                .context("failed to write error log")?;
            Err(err)
        }
    }
}

async fn run_with_timeout(cmd: &mut Command, label: &str) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let status = match timeout(COMMAND_TIMEOUT, child.wait()).await {
        Ok(result) => result.with_context(|| format!("{label} failed"))?,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            anyhow::bail!("{label} timed out after {}s", COMMAND_TIMEOUT.as_secs())
        }
    };
    let mut stdout = Vec::new();
    if let Some(mut pipe) = stdout_pipe.take() {
        let _ = pipe.read_to_end(&mut stdout).await;
    }
    let mut stderr = Vec::new();
    if let Some(mut pipe) = stderr_pipe.take() {
        let _ = pipe.read_to_end(&mut stderr).await;
    }
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}
