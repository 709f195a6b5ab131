use std::fs;
use std::path::Path;

use anyhow::Context;
use report::{CaseInfo, ReportData, Status, Verdict};
use tracing::warn;

/// Reads every fetched marker out of the scratch directory. `.yaml` files
/// are per-host result fragments; `.errorlog` files are turned into a
/// single-case failure fragment carrying the log text. A file that cannot
/// be read or parsed is logged and skipped rather than sinking the run.
pub(crate) fn collect_fragments(dir: &Path) -> anyhow::Result<Vec<ReportData>> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to read scratch directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut fragments = Vec::new();
    for path in paths {
        let extension = path.extension().and_then(|ext| ext.to_str());
        match extension {
            Some("errorlog") => {
                let ip = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();
                match fs::read_to_string(&path) {
                    Ok(text) => fragments.push(error_fragment(&ip, &text)),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unreadable error log");
                    }
                }
            }
            Some("yaml") => match fs::read_to_string(&path) {
                Ok(text) => match serde_yaml::from_str::<ReportData>(&text) {
                    Ok(fragment) => fragments.push(fragment),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping malformed result fragment");
                    }
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable result fragment");
                }
            },
            _ => {}
        }
    }
    Ok(fragments)
}

fn error_fragment(ip: &str, log: &str) -> ReportData {
    ReportData {
        total: 1,
        failure: 1,
        result: Verdict::NotPass,
        cases: vec![CaseInfo {
            identify: "ip".to_string(),
            ip: ip.to_string(),
            role: "node".to_string(),
            name: "inspection run failed".to_string(),
            status: Status::Failure,
            detail: log.trim_end().to_string(),
            duration_time: "0".to_string(),
        }],
        ..ReportData::default()
    }
}
