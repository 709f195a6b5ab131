use std::path::Path;

use anyhow::{bail, Context};
use tracing::info;

/// Fetches one file from the HTTP file store. A non-success status is an
/// error (the store serves plain files, so anything but 200 means "not
/// there").
pub(crate) async fn download(url: &str, dest: &Path) -> anyhow::Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to reach file store at {url}"))?;
    if !response.status().is_success() {
        bail!("file not found at {url}: status {}", response.status());
    }
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read response body from {url}"))?;
    tokio::fs::write(dest, &bytes)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))?;
    info!(url, dest = %dest.display(), bytes = bytes.len(), "file downloaded");
    Ok(())
}
