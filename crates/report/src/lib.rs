mod render;

use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::error;

pub use render::render_html;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of one named check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Success,
    Failure,
    Warning,
}

/// Overall verdict of a run. `not pass` exactly when any case failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[default]
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "not pass")]
    NotPass,
}

/// One named check result for one host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaseInfo {
    pub identify: String,
    pub ip: String,
    pub role: String,
    pub name: String,
    pub status: Status,
    pub detail: String,
    pub duration_time: String,
}

/// Per-host hardware/OS inventory attached to a report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerInfo {
    pub ip: String,
    pub role_def: Vec<String>,
    pub role: String,
    pub os: String,
    pub kernel: String,
    pub cpu: String,
    pub memory: String,
    pub network: String,
    pub disk: String,
    pub is_physics: i64,
}

/// The aggregate report, also the wire format of per-host result
/// fragments. Invariant: `total == success + failure` with warnings
/// accounted separately, and `result` is `not pass` iff `failure > 0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportData {
    pub start_time: String,
    pub duration_time: String,
    pub random_seed: String,
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub warning: i64,
    pub result: Verdict,
    #[serde(rename = "case")]
    pub cases: Vec<CaseInfo>,
    #[serde(rename = "server")]
    pub servers: Vec<ServerInfo>,
}

/// Merges fragments into one report: totals summed, case and server lists
/// concatenated in input order, verdict derived from the summed failures,
/// and a reproducibility fingerprint over the totals.
pub fn aggregate(start_time: DateTime<Local>, fragments: &[ReportData]) -> ReportData {
    let mut merged = ReportData {
        start_time: start_time.format(TIME_FORMAT).to_string(),
        result: Verdict::Pass,
        ..ReportData::default()
    };
    for fragment in fragments {
        merged.total += fragment.total;
        merged.success += fragment.success;
        merged.failure += fragment.failure;
        merged.warning += fragment.warning;
        merged.cases.extend(fragment.cases.iter().cloned());
        merged.servers.extend(fragment.servers.iter().cloned());
    }
    if merged.failure > 0 {
        merged.result = Verdict::NotPass;
    }
    merged.random_seed = fingerprint(&merged);
    let elapsed = (Local::now() - start_time).to_std().unwrap_or_default();
    merged.duration_time = humantime::format_duration(elapsed).to_string();
    merged
}

/// Deterministic digest over the start time and totals. Identifies a run
/// for comparison; not a security value.
pub fn fingerprint(data: &ReportData) -> String {
    let factor = format!(
        "{}{}{}{}{}",
        data.start_time, data.total, data.success, data.failure, data.warning
    );
    format!("{:x}", md5::compute(factor.as_bytes()))
}

/// Aggregates and writes both sinks. The two sinks are independent and a
/// failed write never changes the computed verdict, so the merged data is
/// returned regardless.
pub fn generate(
    start_time: DateTime<Local>,
    fragments: &[ReportData],
    html_path: &Path,
    json_path: &Path,
) -> ReportData {
    let merged = aggregate(start_time, fragments);
    if let Err(err) = render::write_html(&merged, html_path) {
        error!(path = %html_path.display(), error = %err, "failed to write html report");
    }
    if let Err(err) = render::write_json(&merged, json_path) {
        error!(path = %json_path.display(), error = %err, "failed to write json report");
    }
    merged
}
