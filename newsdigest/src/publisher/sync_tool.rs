use anyhow::{bail, Context, Result};
use common::SyncToolConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::PublishReport;

/// Where one file goes under the sync-tool strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Upload(&'a str),
    /// The destination this file type needs is not configured; names the variable.
    Skip(&'static str),
}

/// `.md` to the Markdown destination, `.pdf` to the PDF destination, anything
/// else to whichever destination exists (Markdown first).
pub fn route<'a>(cfg: &'a SyncToolConfig, path: &Path) -> Route<'a> {
    let extension = path.extension().and_then(|e| e.to_str());
    let dest = match extension {
        Some("md") => return cfg.md_dest.as_deref().map_or(Route::Skip("RCLONE_MD_DEST"), Route::Upload),
        Some("pdf") => return cfg.pdf_dest.as_deref().map_or(Route::Skip("RCLONE_PDF_DEST"), Route::Upload),
        _ => cfg.md_dest.as_deref().or(cfg.pdf_dest.as_deref()),
    };
    dest.map_or(Route::Skip("RCLONE_MD_DEST"), Route::Upload)
}

/// `dest` without trailing slashes, then `/<file name>`.
pub fn remote_path(dest: &str, file_name: &str) -> String {
    format!("{}/{}", dest.trim_end_matches('/'), file_name)
}

/// Run `<binary> copyto <src> <remote>`; returns the remote path.
pub async fn copy_file(binary: &str, src: &Path, dest: &str) -> Result<String> {
    let file_name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?
        .to_string_lossy();
    let full_dest = remote_path(dest, &file_name);

    let output = match tokio::process::Command::new(binary)
        .arg("copyto")
        .arg(src)
        .arg(&full_dest)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            bail!("{} is not installed or not in PATH", binary)
        }
        Err(e) => return Err(e).with_context(|| format!("failed to run {}", binary)),
    };

    if !output.status.success() {
        bail!(
            "{} error ({}): {}",
            binary,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(full_dest)
}

/// Upload every file with the sync tool; failures never stop the remaining files.
pub async fn publish(cfg: &SyncToolConfig, files: &[PathBuf]) -> PublishReport {
    info!("Using {} for upload...", cfg.binary);
    let mut report = PublishReport::default();

    for path in files {
        if !path.exists() {
            warn!("File not found: {}", path.display());
            report.skipped.push(path.clone());
            continue;
        }

        let dest = match route(cfg, path) {
            Route::Upload(dest) => dest,
            Route::Skip(var) => {
                warn!("Skipping {}: {} not configured", path.display(), var);
                report.skipped.push(path.clone());
                continue;
            }
        };

        match copy_file(&cfg.binary, path, dest).await {
            Ok(full_dest) => {
                info!("Successfully uploaded {} via {} to: {}", path.display(), cfg.binary, full_dest);
                report.uploaded.push(path.clone());
            }
            Err(e) => {
                error!("Upload of {} failed: {:#}", path.display(), e);
                report.failed.push(path.clone());
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(md: Option<&str>, pdf: Option<&str>, binary: &str) -> SyncToolConfig {
        SyncToolConfig {
            md_dest: md.map(String::from),
            pdf_dest: pdf.map(String::from),
            binary: binary.to_string(),
        }
    }

    #[test]
    fn routes_by_extension() {
        let both = config(Some("remote:md"), Some("remote:pdf"), "rclone");
        assert_eq!(route(&both, Path::new("a/report.md")), Route::Upload("remote:md"));
        assert_eq!(route(&both, Path::new("report.pdf")), Route::Upload("remote:pdf"));
        assert_eq!(route(&both, Path::new("data.csv")), Route::Upload("remote:md"));

        let pdf_only = config(None, Some("remote:pdf"), "rclone");
        assert_eq!(route(&pdf_only, Path::new("report.md")), Route::Skip("RCLONE_MD_DEST"));
        assert_eq!(route(&pdf_only, Path::new("data.csv")), Route::Upload("remote:pdf"));

        let md_only = config(Some("remote:md"), None, "rclone");
        assert_eq!(route(&md_only, Path::new("x.pdf")), Route::Skip("RCLONE_PDF_DEST"));
    }

    #[test]
    fn remote_path_drops_trailing_slash() {
        assert_eq!(remote_path("remote:docs/", "a.md"), "remote:docs/a.md");
        assert_eq!(remote_path("remote:docs", "a.md"), "remote:docs/a.md");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failures_do_not_stop_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("digest.md");
        let pdf = dir.path().join("digest.pdf");
        std::fs::write(&md, "# digest").unwrap();
        std::fs::write(&pdf, "%PDF").unwrap();
        let missing = dir.path().join("missing.md");

        let ok = config(Some("remote:md"), None, "true");
        let report = publish(&ok, &[md.clone(), pdf.clone(), missing.clone()]).await;
        assert_eq!(report.uploaded, vec![md.clone()]);
        assert_eq!(report.skipped, vec![pdf.clone(), missing]);

        let failing = config(Some("remote:md"), Some("remote:pdf"), "false");
        let report = publish(&failing, &[md, pdf]).await;
        assert_eq!(report.failed.len(), 2);
        assert!(report.uploaded.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("digest.md");
        std::fs::write(&md, "# digest").unwrap();

        let err = copy_file("newsdigest-no-such-sync-tool", &md, "remote:md")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not installed or not in PATH"));
    }
}
