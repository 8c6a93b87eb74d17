use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use tokio::fs;

use crate::result::CanonicalResult;
use crate::source::Source;

/// Writes `result` as `<out_dir>/<UTC timestamp>_<source>_<suffix>.json` and
/// returns the path. The file appears atomically.
pub async fn write_result(
    out_dir: &Path,
    source: Option<Source>,
    result: &CanonicalResult,
) -> anyhow::Result<PathBuf> {
    let path = out_dir.join(result_file_name(source));
    write_json_atomic(&path, result).await?;
    tracing::info!(path = %path.display(), status = ?result.status(), "wrote result");
    Ok(path)
}

fn result_file_name(source: Option<Source>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}.json",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        source.map(Source::as_str).unwrap_or("unknown"),
        &suffix[..8]
    )
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let mut data = serde_json::to_vec_pretty(value).context("serialize json")?;
    data.push(b'\n');
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
