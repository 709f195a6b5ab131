use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::{ReportData, Status, Verdict};

/// Builds the human-readable report document. Styling is intentionally
/// plain; the aggregate data is the contract, the page is a convenience.
pub fn render_html(data: &ReportData) -> String {
    let verdict = match data.result {
        Verdict::Pass => "pass",
        Verdict::NotPass => "not pass",
    };
    let mut page = String::new();
    let _ = write!(
        page,
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Fleet inspection report</title></head>\n<body>\n\
<h1>Fleet inspection report</h1>\n\
<p>Started {} &middot; took {} &middot; seed {}</p>\n\
<p>Result: <strong>{}</strong> &mdash; total {}, success {}, failure {}, warning {}</p>\n\
<table border=\"1\" cellspacing=\"0\" cellpadding=\"4\">\n\
<tr><th>IP</th><th>Role</th><th>Check</th><th>Status</th><th>Detail</th><th>Duration</th></tr>\n",
        escape(&data.start_time),
        escape(&data.duration_time),
        escape(&data.random_seed),
        verdict,
        data.total,
        data.success,
        data.failure,
        data.warning,
    );
    for case in &data.cases {
        let status = match case.status {
            Status::Success => "Success",
            Status::Failure => "Failure",
            Status::Warning => "Warning",
        };
        let _ = write!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&case.ip),
            escape(&case.role),
            escape(&case.name),
            status,
            escape(&case.detail),
            escape(&case.duration_time),
        );
    }
    page.push_str("</table>\n</body>\n</html>\n");
    page
}

pub(crate) fn write_html(data: &ReportData, path: &Path) -> anyhow::Result<()> {
    let _ = fs::remove_file(path);
    fs::write(path, render_html(data))?;
    Ok(())
}

pub(crate) fn write_json(data: &ReportData, path: &Path) -> anyhow::Result<()> {
    fs::write(path, serde_json::to_vec(data)?)?;
    Ok(())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
