use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Local};
use remote::{dispatch, Command, Connect, DispatchResult, Host, Session, SshConnector};
use report::{CaseInfo, ReportData, Status, Verdict, TIME_FORMAT};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::collect::collect_fragments;
use crate::config;
use crate::poll::poll_until_resolved;
use crate::repo;

// Protocol constants shared between the launching and polling sides. The
// marker file names are exact: the remote inspection writes them and the
// poll loop matches directory entries against them verbatim.
pub(crate) const REMOTE_WORK_DIR: &str = "/tmp/precheck";
pub(crate) const RESULT_FILE: &str = "result.yaml";
pub(crate) const ERROR_FILE: &str = "error.log";
pub(crate) const HTTP_PID_FILE: &str = "httppid";
pub(crate) const CHECK_PID_FILE: &str = "checkpid";
pub(crate) const REMOTE_BINARY: &str = "nodesweep";
pub(crate) const REMOTE_CONFIG: &str = "nodes.yaml";

const SCRATCH_DIR: &str = "/tmp/report";
const POLL_INTERVAL: Duration = Duration::from_secs(15);
const ARCH_PROBE: &str =
    "echo $(uname -m | sed 's/x86_64/amd64/;s/aarch64/arm64/;s/^unknown$/amd64/')";

pub(crate) struct BatchOptions {
    pub(crate) file: PathBuf,
    pub(crate) http_repo: String,
    pub(crate) kube_version: String,
    pub(crate) runtime: String,
}

/// One fleet operation. All run state lives here, so independent runs do
/// not observe each other.
pub(crate) struct BatchRun {
    opts: BatchOptions,
    connector: Arc<dyn Connect>,
    scratch_dir: PathBuf,
    html_path: PathBuf,
    json_path: PathBuf,
    start_time: DateTime<Local>,
    hosts: Vec<Host>,
    /// Validated hosts with their connection held open for the polling
    /// phase, keyed by IP.
    tasks: HashMap<String, Box<dyn Session>>,
    amd64_hosts: Vec<Host>,
    arm64_hosts: Vec<Host>,
}

struct Validation {
    cases: Vec<CaseInfo>,
    failures: usize,
    error: Option<anyhow::Error>,
}

pub(crate) async fn run(opts: BatchOptions) -> anyhow::Result<()> {
    BatchRun::new(opts, Arc::new(SshConnector)).execute().await
}

impl BatchRun {
    fn new(opts: BatchOptions, connector: Arc<dyn Connect>) -> Self {
        Self {
            opts,
            connector,
            scratch_dir: PathBuf::from(SCRATCH_DIR),
            html_path: PathBuf::from("report.html"),
            json_path: PathBuf::from("report.json"),
            start_time: Local::now(),
            hosts: Vec::new(),
            tasks: HashMap::new(),
            amd64_hosts: Vec::new(),
            arm64_hosts: Vec::new(),
        }
    }

    async fn execute(mut self) -> anyhow::Result<()> {
        let _ = fs::remove_dir_all(&self.scratch_dir);
        fs::create_dir_all(&self.scratch_dir).context("failed to create scratch directory")?;

        info!("validating configuration and connecting to hosts");
        let validation = self.validate_config().await;
        if let Some(error) = validation.error {
            warn!(error = %error, "configuration validation failed, see report");
            self.abort(validation.cases, validation.failures, Some(error))
                .await;
            return Ok(());
        }

        info!("clearing previous run state on all hosts");
        let result = dispatch(
            Arc::clone(&self.connector),
            &self.active_hosts(),
            &env_reset_command(),
        )
        .await;
        if let Err(error) = fail_on_diagnostics(result, "environment reset failed") {
            self.abort(Vec::new(), 0, Some(error)).await;
            return Ok(());
        }

        info!("distributing inspection files to hosts");
        if let Err(error) = self.distribute().await {
            self.abort(Vec::new(), 0, Some(error)).await;
            return Ok(());
        }

        info!("launching remote inspection on all hosts");
        let result = dispatch(
            Arc::clone(&self.connector),
            &self.active_hosts(),
            &self.launch_command(),
        )
        .await;
        if let Err(error) = fail_on_diagnostics(result, "failed to launch remote inspection") {
            self.abort(Vec::new(), 0, Some(error)).await;
            return Ok(());
        }

        let mut fragments =
            match poll_until_resolved(&self.tasks, &self.scratch_dir, POLL_INTERVAL).await {
                Ok(gaps) => gaps,
                Err(error) => {
                    self.abort(Vec::new(), 0, Some(error)).await;
                    return Ok(());
                }
            };

        match collect_fragments(&self.scratch_dir) {
            Ok(collected) => fragments.extend(collected),
            Err(error) => {
                self.abort(Vec::new(), 0, Some(error)).await;
                return Ok(());
            }
        }

        let merged = report::generate(
            self.start_time,
            &fragments,
            &self.html_path,
            &self.json_path,
        );
        info!(
            total = merged.total,
            failure = merged.failure,
            result = ?merged.result,
            "inspection report generated: {}",
            self.html_path.display()
        );

        self.cleanup().await;
        Ok(())
    }

    /// Parses the hosts file, rejects duplicate IPs and incomplete
    /// credentials, opens a connection to every host that has credentials,
    /// and sorts reachable hosts into architecture groups when the
    /// repository serves per-arch binaries. Each check leaves a case entry.
    async fn validate_config(&mut self) -> Validation {
        let mut cases = Vec::new();

        let raw = match fs::read_to_string(&self.opts.file) {
            Ok(raw) => raw,
            Err(err) => {
                cases.push(config_failure("failed to read hosts file", &err.to_string()));
                return Validation {
                    cases,
                    failures: 1,
                    error: Some(anyhow!(err).context("failed to read hosts file")),
                };
            }
        };
        let parsed = match config::parse_hosts(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                cases.push(config_failure("failed to parse hosts file", &err.to_string()));
                return Validation {
                    cases,
                    failures: 1,
                    error: Some(anyhow!(err).context("failed to parse hosts file")),
                };
            }
        };
        if let Some(ip) = config::find_duplicate_ip(&parsed.hosts) {
            let detail = format!("host ip {ip} appears more than once");
            cases.push(config_failure("duplicate host ip", &detail));
            return Validation {
                cases,
                failures: 1,
                error: Some(anyhow!(detail)),
            };
        }
        self.hosts = parsed.hosts;

        let multi_arch = self.fetch_arch_binaries().await;

        let mut failures = 0;
        for host in self.hosts.clone() {
            if !host.has_credentials() {
                info!(host = %host.ip, "no credentials supplied, skipping host");
                continue;
            }
            for (empty, name) in [
                (host.ip.is_empty(), "host ip is empty"),
                (host.username.is_empty(), "username is empty"),
                (host.password.is_empty(), "password is empty"),
                (host.port.is_empty(), "port is empty"),
            ] {
                if empty {
                    failures += 1;
                    cases.push(host_failure(&host.ip, name, name));
                }
            }

            let started = Instant::now();
            match self.connector.connect(&host).await {
                Err(err) => {
                    failures += 1;
                    cases.push(CaseInfo {
                        identify: "ip".to_string(),
                        ip: host.ip.clone(),
                        role: "config check".to_string(),
                        name: "ssh connection".to_string(),
                        status: Status::Failure,
                        detail: err.to_string(),
                        duration_time: format!("{:?}", started.elapsed()),
                    });
                }
                Ok(session) => {
                    cases.push(CaseInfo {
                        identify: "ip".to_string(),
                        ip: host.ip.clone(),
                        role: "config check".to_string(),
                        name: "ssh connection".to_string(),
                        status: Status::Success,
                        detail: "ssh connection established".to_string(),
                        duration_time: "0".to_string(),
                    });
                    if multi_arch {
                        match session.exec(ARCH_PROBE).await {
                            Ok(output)
                                if output.stderr.is_empty() && !output.stdout.is_empty() =>
                            {
                                if output.stdout[0].trim() == "arm64" {
                                    self.arm64_hosts.push(host.clone());
                                } else {
                                    self.amd64_hosts.push(host.clone());
                                }
                            }
                            Ok(output) => {
                                failures += 1;
                                cases.push(host_failure(
                                    &host.ip,
                                    "probe target architecture",
                                    &output.stderr.join(","),
                                ));
                            }
                            Err(err) => {
                                failures += 1;
                                cases.push(host_failure(
                                    &host.ip,
                                    "probe target architecture",
                                    &err.to_string(),
                                ));
                            }
                        }
                    }
                    self.tasks.insert(host.ip.clone(), session);
                }
            }
        }

        let error = (failures > 0).then(|| anyhow!("host configuration validation failed"));
        Validation {
            cases,
            failures,
            error,
        }
    }

    /// Pulls the per-architecture binaries from the repository into the
    /// working directory. Multi-arch distribution only kicks in when both
    /// are available; a missing one is logged, not fatal, because a
    /// single-binary repository is a supported layout.
    async fn fetch_arch_binaries(&self) -> bool {
        if self.opts.http_repo.is_empty() {
            return false;
        }
        for name in [arch_binary_name("amd64"), arch_binary_name("arm64")] {
            let url = format!("{}{}", self.opts.http_repo, name);
            if let Err(err) = repo::download(&url, Path::new(&name)).await {
                warn!(error = %err, "could not fetch {name} from repository");
            }
        }
        Path::new(&arch_binary_name("amd64")).exists()
            && Path::new(&arch_binary_name("arm64")).exists()
    }

    async fn distribute(&self) -> anyhow::Result<()> {
        if !self.amd64_hosts.is_empty() || !self.arm64_hosts.is_empty() {
            let cwd = std::env::current_dir().context("failed to resolve working directory")?;
            for (hosts, name) in [
                (&self.amd64_hosts, arch_binary_name("amd64")),
                (&self.arm64_hosts, arch_binary_name("arm64")),
            ] {
                if hosts.is_empty() {
                    continue;
                }
                let command = distribute_command(&cwd.join(&name), &self.opts.file, &name);
                let result = dispatch(Arc::clone(&self.connector), hosts, &command).await;
                fail_on_diagnostics(result, "file distribution failed")?;
            }
            return Ok(());
        }
        // No per-arch repository: every host gets the binary this
        // controller itself is running.
        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        let name = exe
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| REMOTE_BINARY.to_string());
        let command = distribute_command(&exe, &self.opts.file, &name);
        let result = dispatch(Arc::clone(&self.connector), &self.active_hosts(), &command).await;
        fail_on_diagnostics(result, "file distribution failed")
    }

    /// Starts the inspection in the background and records its pid where
    /// the poll loop expects it.
    fn launch_command(&self) -> Command {
        Command::new().run(format!(
            "sudo sh -c 'cd {dir} && nohup ./{bin} agent-reset --http-repo {repo} \
             --kube-version {version} --runtime {runtime} >/dev/null 2>&1 & \
             echo $! > {dir}/{pid}'",
            dir = REMOTE_WORK_DIR,
            bin = REMOTE_BINARY,
            repo = self.opts.http_repo,
            version = self.opts.kube_version,
            runtime = self.opts.runtime,
            pid = CHECK_PID_FILE,
        ))
    }

    async fn cleanup(&mut self) {
        let _ = fs::remove_dir_all(&self.scratch_dir);
        self.close_tasks().await;
        let result = dispatch(
            Arc::clone(&self.connector),
            &self.active_hosts(),
            &teardown_command(),
        )
        .await;
        // The verdict is already decided; teardown problems are only noted.
        for (ip, diagnostics) in result {
            warn!(host = %ip, "cleanup reported: {}", diagnostics.join("; "));
        }
    }

    async fn close_tasks(&mut self) {
        for (_, session) in self.tasks.drain() {
            session.close().await;
        }
    }

    /// Every fatal path funnels through here so the user always gets a
    /// report document describing what happened. Failures that are not
    /// attributable to a host get an explicit controller case entry.
    async fn abort(
        &mut self,
        mut cases: Vec<CaseInfo>,
        failures: usize,
        error: Option<anyhow::Error>,
    ) {
        self.close_tasks().await;
        let mut total = cases.len() as i64;
        let mut failure = failures as i64;
        if let Some(error) = &error {
            total += 1;
            failure += 1;
            cases.push(CaseInfo {
                identify: "error".to_string(),
                ip: "controller".to_string(),
                role: "controller".to_string(),
                name: "unexpected error".to_string(),
                status: Status::Failure,
                detail: format!("{error:#}"),
                duration_time: "0".to_string(),
            });
        }
        let data = ReportData {
            start_time: self.start_time.format(TIME_FORMAT).to_string(),
            total,
            success: total - failure,
            failure,
            result: Verdict::NotPass,
            cases,
            ..ReportData::default()
        };
        let merged = report::generate(
            self.start_time,
            &[data],
            &self.html_path,
            &self.json_path,
        );
        warn!(
            total = merged.total,
            failure = merged.failure,
            "error report generated: {}",
            self.html_path.display()
        );
    }

    fn active_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|host| host.has_credentials())
            .cloned()
            .collect()
    }
}

fn arch_binary_name(arch: &str) -> String {
    format!("{REMOTE_BINARY}-{arch}")
}

fn env_reset_command() -> Command {
    Command::new()
        .run(format!("sudo mkdir -p {REMOTE_WORK_DIR}"))
        .run(format!("sudo chmod 777 {REMOTE_WORK_DIR}"))
        .run(format!("sudo rm -rf {REMOTE_WORK_DIR}/{ERROR_FILE}"))
        .run(kill_by_pid_file(HTTP_PID_FILE))
        .run(kill_by_pid_file(CHECK_PID_FILE))
}

fn teardown_command() -> Command {
    Command::new()
        .run(kill_by_pid_file(HTTP_PID_FILE))
        .run(format!("sudo rm -rf {REMOTE_WORK_DIR}"))
}

/// Absent pid files are the normal case on a fresh host, so the lookup
/// and the kill are both silenced.
fn kill_by_pid_file(pid_file: &str) -> String {
    format!(
        "sudo sh -c 'kill -9 $(cat {REMOTE_WORK_DIR}/{pid_file} 2>/dev/null) 2>/dev/null || true'"
    )
}

fn distribute_command(binary: &Path, conf: &Path, binary_name: &str) -> Command {
    let conf_name = conf
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| REMOTE_CONFIG.to_string());
    let mut command = Command::new()
        .upload(binary, REMOTE_WORK_DIR)
        .upload(conf, REMOTE_WORK_DIR);
    if binary_name != REMOTE_BINARY {
        command = command.run(format!(
            "sudo mv {REMOTE_WORK_DIR}/{binary_name} {REMOTE_WORK_DIR}/{REMOTE_BINARY}"
        ));
    }
    if conf_name != REMOTE_CONFIG {
        command = command.run(format!(
            "sudo mv {REMOTE_WORK_DIR}/{conf_name} {REMOTE_WORK_DIR}/{REMOTE_CONFIG}"
        ));
    }
    command.run(format!("sudo chmod +x {REMOTE_WORK_DIR}/{REMOTE_BINARY}"))
}

fn fail_on_diagnostics(result: DispatchResult, what: &str) -> anyhow::Result<()> {
    if result.is_empty() {
        return Ok(());
    }
    let mut parts: Vec<String> = result
        .into_iter()
        .map(|(ip, diagnostics)| format!("{ip}: {}", diagnostics.join("; ")))
        .collect();
    parts.sort();
    anyhow::bail!("{what}: {}", parts.join(" | "))
}

fn config_failure(name: &str, detail: &str) -> CaseInfo {
    CaseInfo {
        identify: "public".to_string(),
        role: "config check".to_string(),
        name: name.to_string(),
        status: Status::Failure,
        detail: detail.to_string(),
        duration_time: "0".to_string(),
        ..CaseInfo::default()
    }
}

fn host_failure(ip: &str, name: &str, detail: &str) -> CaseInfo {
    CaseInfo {
        identify: "ip".to_string(),
        ip: ip.to_string(),
        role: "config check".to_string(),
        name: name.to_string(),
        status: Status::Failure,
        detail: detail.to_string(),
        duration_time: "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_command_orders_uploads_before_renames() {
        let command = distribute_command(
            Path::new("/work/nodesweep-amd64"),
            Path::new("/work/fleet.yaml"),
            "nodesweep-amd64",
        );
        assert_eq!(command.uploads.len(), 2);
        assert!(command.commands[0].contains("mv /tmp/precheck/nodesweep-amd64"));
        assert!(command.commands[1].contains("mv /tmp/precheck/fleet.yaml"));
        assert!(command.commands[2].contains("chmod +x /tmp/precheck/nodesweep"));
    }

    #[test]
    fn distribute_command_skips_renames_that_would_be_noops() {
        let command = distribute_command(
            Path::new("/work/nodesweep"),
            Path::new("/work/nodes.yaml"),
            "nodesweep",
        );
        assert_eq!(command.commands.len(), 1);
        assert!(command.commands[0].contains("chmod +x"));
    }

    #[test]
    fn diagnostics_become_one_error_listing_every_host() {
        let mut result = DispatchResult::new();
        result.insert("10.0.0.2".to_string(), vec!["boom".to_string()]);
        result.insert(
            "10.0.0.1".to_string(),
            vec!["first".to_string(), "second".to_string()],
        );
        let err = fail_on_diagnostics(result, "launch failed").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("launch failed: 10.0.0.1: first; second"));
        assert!(message.contains("10.0.0.2: boom"));
    }

    #[test]
    fn empty_dispatch_result_is_success() {
        assert!(fail_on_diagnostics(DispatchResult::new(), "x").is_ok());
    }

    mod end_to_end {
        use std::sync::atomic::{AtomicU32, Ordering};

        use async_trait::async_trait;
        use remote::{ExecOutput, TransportError};
        use report::Verdict;
        use tokio::time::Instant;

        use super::*;

        /// What one host does during a run: stay alive for a number of
        /// poll probes, then expose a marker file whose download yields
        /// `payload`.
        struct HostScript {
            cycles_until_exit: u32,
            probes: Arc<AtomicU32>,
            marker: &'static str,
            payload: &'static str,
            probe_error: bool,
        }

        impl HostScript {
            fn new(cycles_until_exit: u32, marker: &'static str, payload: &'static str) -> Self {
                Self {
                    cycles_until_exit,
                    probes: Arc::new(AtomicU32::new(0)),
                    marker,
                    payload,
                    probe_error: false,
                }
            }

            fn broken_probe() -> Self {
                Self {
                    probe_error: true,
                    ..Self::new(0, RESULT_FILE, "")
                }
            }
        }

        struct ScriptedConnector {
            scripts: HashMap<String, HostScript>,
        }

        #[async_trait]
        impl Connect for ScriptedConnector {
            async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError> {
                let script = self
                    .scripts
                    .get(&host.ip)
                    .unwrap_or_else(|| panic!("unscripted host {}", host.ip));
                Ok(Box::new(ScriptedSession {
                    cycles_until_exit: script.cycles_until_exit,
                    probes: Arc::clone(&script.probes),
                    marker: script.marker,
                    payload: script.payload,
                    probe_error: script.probe_error,
                }))
            }
        }

        struct ScriptedSession {
            cycles_until_exit: u32,
            probes: Arc<AtomicU32>,
            marker: &'static str,
            payload: &'static str,
            probe_error: bool,
        }

        #[async_trait]
        impl Session for ScriptedSession {
            async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError> {
                if cmd.contains("/proc/") {
                    if self.probe_error {
                        return Err(TransportError::Connect {
                            addr: "10.0.0.1:22".to_string(),
                            detail: "broken pipe".to_string(),
                        });
                    }
                    let probe = self.probes.fetch_add(1, Ordering::SeqCst);
                    if probe < self.cycles_until_exit {
                        return Ok(ExecOutput {
                            stdout: vec!["/proc/7/exe".to_string()],
                            stderr: Vec::new(),
                        });
                    }
                    return Ok(ExecOutput {
                        stdout: Vec::new(),
                        stderr: vec!["No such file or directory".to_string()],
                    });
                }
                if cmd == format!("ls {REMOTE_WORK_DIR}") {
                    return Ok(ExecOutput {
                        stdout: vec![CHECK_PID_FILE.to_string(), self.marker.to_string()],
                        stderr: Vec::new(),
                    });
                }
                Ok(ExecOutput::default())
            }

            async fn upload_file(&self, _: &Path, _: &str) -> Result<(), TransportError> {
                Ok(())
            }

            async fn download_file(
                &self,
                local: &Path,
                _: &str,
            ) -> Result<(), TransportError> {
                fs::write(local, self.payload)?;
                Ok(())
            }

            async fn close(&self) {}
        }

        const PASSING_FRAGMENT: &str = "\
total: 1
success: 1
failure: 0
result: pass
case:
  - identify: ip
    role: node
    name: disk space
    status: Success
    detail: ok
    durationTime: \"1s\"
";

        fn host_line(ip: &str) -> String {
            format!("  - ip: {ip}\n    username: root\n    password: secret\n    port: \"22\"\n")
        }

        #[tokio::test(start_paused = true)]
        async fn partial_failure_run_produces_a_not_pass_report() {
            let dir = tempfile::tempdir().unwrap();
            let hosts_file = dir.path().join("nodes.yaml");
            fs::write(
                &hosts_file,
                format!(
                    "hosts:\n{}{}{}",
                    host_line("10.0.0.1"),
                    host_line("10.0.0.2"),
                    host_line("10.0.0.3")
                ),
            )
            .unwrap();

            // Two hosts finish on the first poll cycle with results; the
            // third needs a second cycle and leaves an error log.
            let mut scripts = HashMap::new();
            scripts.insert(
                "10.0.0.1".to_string(),
                HostScript::new(0, RESULT_FILE, PASSING_FRAGMENT),
            );
            scripts.insert(
                "10.0.0.2".to_string(),
                HostScript::new(0, RESULT_FILE, PASSING_FRAGMENT),
            );
            scripts.insert(
                "10.0.0.3".to_string(),
                HostScript::new(1, ERROR_FILE, "agent reset exploded\n"),
            );

            let opts = BatchOptions {
                file: hosts_file,
                http_repo: String::new(),
                kube_version: "v1.28.2".to_string(),
                runtime: "docker".to_string(),
            };
            let mut run = BatchRun::new(opts, Arc::new(ScriptedConnector { scripts }));
            run.scratch_dir = dir.path().join("scratch");
            run.html_path = dir.path().join("report.html");
            run.json_path = dir.path().join("report.json");
            let json_path = run.json_path.clone();
            let html_path = run.html_path.clone();
            let scratch_dir = run.scratch_dir.clone();

            let started = Instant::now();
            run.execute().await.unwrap();

            // One cycle resolves two hosts, the second resolves the last.
            assert_eq!(started.elapsed(), Duration::from_secs(30));

            let merged: ReportData =
                serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
            assert_eq!(merged.total, 3);
            assert_eq!(merged.success, 2);
            assert_eq!(merged.failure, 1);
            assert_eq!(merged.result, Verdict::NotPass);
            assert_eq!(merged.cases.len(), 3);
            let failed: Vec<_> = merged
                .cases
                .iter()
                .filter(|case| case.status == Status::Failure)
                .collect();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].ip, "10.0.0.3");
            assert!(failed[0].detail.contains("agent reset exploded"));
            assert!(html_path.exists());
            assert!(!scratch_dir.exists());
        }

        #[tokio::test(start_paused = true)]
        async fn poll_failure_funnels_into_a_controller_error_report() {
            let dir = tempfile::tempdir().unwrap();
            let hosts_file = dir.path().join("nodes.yaml");
            fs::write(&hosts_file, format!("hosts:\n{}", host_line("10.0.0.1"))).unwrap();

            let mut scripts = HashMap::new();
            scripts.insert("10.0.0.1".to_string(), HostScript::broken_probe());

            let opts = BatchOptions {
                file: hosts_file,
                http_repo: String::new(),
                kube_version: "v1.28.2".to_string(),
                runtime: "docker".to_string(),
            };
            let mut run = BatchRun::new(opts, Arc::new(ScriptedConnector { scripts }));
            run.scratch_dir = dir.path().join("scratch");
            run.html_path = dir.path().join("report.html");
            run.json_path = dir.path().join("report.json");
            let json_path = run.json_path.clone();

            run.execute().await.unwrap();

            let merged: ReportData =
                serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
            assert_eq!(merged.result, Verdict::NotPass);
            assert_eq!(merged.failure, 1);
            let controller = merged
                .cases
                .iter()
                .find(|case| case.ip == "controller")
                .unwrap();
            assert_eq!(controller.status, Status::Failure);
            assert!(controller
                .detail
                .contains("failed to probe inspection process on 10.0.0.1"));
        }

        #[tokio::test(start_paused = true)]
        async fn duplicate_host_ip_aborts_before_any_connection() {
            let dir = tempfile::tempdir().unwrap();
            let hosts_file = dir.path().join("nodes.yaml");
            fs::write(
                &hosts_file,
                format!("hosts:\n{}{}", host_line("10.0.0.1"), host_line("10.0.0.1")),
            )
            .unwrap();

            let opts = BatchOptions {
                file: hosts_file,
                http_repo: String::new(),
                kube_version: "v1.28.2".to_string(),
                runtime: "docker".to_string(),
            };
            // An empty script table panics on any connection attempt.
            let mut run = BatchRun::new(
                opts,
                Arc::new(ScriptedConnector {
                    scripts: HashMap::new(),
                }),
            );
            run.scratch_dir = dir.path().join("scratch");
            run.html_path = dir.path().join("report.html");
            run.json_path = dir.path().join("report.json");
            let json_path = run.json_path.clone();

            run.execute().await.unwrap();

            let merged: ReportData =
                serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
            assert_eq!(merged.result, Verdict::NotPass);
            assert!(merged
                .cases
                .iter()
                .any(|case| case.detail.contains("appears more than once")));
        }
    }
}
