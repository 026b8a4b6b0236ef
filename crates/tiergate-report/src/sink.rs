use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::{render_markdown, EscalationReport};

/// External destination for escalation reports. Sinks only ever create new
/// files; an existing report is never overwritten.
pub trait ReportSink {
    fn sink_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn write_report(&self, report: &EscalationReport) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl ReportSink for JsonFileSink {
    fn sink_name(&self) -> &'static str {
        "json_file"
    }

    fn write_report(&self, report: &EscalationReport) -> Result<PathBuf> {
        let body = serde_json::to_vec_pretty(report).context("failed to encode report")?;
        let path = self.dir.join(format!("escalation-{}.json", report.run_id));
        create_new(&path, &body)?;
        info!(run_id = %report.run_id, path = %path.display(), "escalation report written");
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct MarkdownFileSink {
    dir: PathBuf,
}

impl MarkdownFileSink {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl ReportSink for MarkdownFileSink {
    fn sink_name(&self) -> &'static str {
        "markdown_file"
    }

    fn write_report(&self, report: &EscalationReport) -> Result<PathBuf> {
        let path = self.dir.join(format!("escalation-{}.md", report.run_id));
        create_new(&path, render_markdown(report).as_bytes())?;
        Ok(path)
    }
}

fn create_new(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create report dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create report {}", path.display()))?;
    file.write_all(body)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync report {}", path.display()))?;
    Ok(())
}
