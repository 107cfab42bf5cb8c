use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

pub const MIGRATION_LOG_FILE: &str = "_outline_migration_log.md";
pub const MIGRATION_FAILURES_FILE: &str = "_outline_migration_failures.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Document,
    Attachments,
    Move,
    Crosslinks,
}

impl LogCategory {
    pub const ALL: [Self; 4] = [Self::Document, Self::Attachments, Self::Move, Self::Crosslinks];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Attachments => "attachments",
            Self::Move => "move",
            Self::Crosslinks => "crosslinks",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::Document => "Document",
            Self::Attachments => "Attachments",
            Self::Move => "Move",
            Self::Crosslinks => "Crosslinks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Optional context attached to a log entry; enough to manually re-run or
/// hand-fix the offending item.
#[derive(Debug, Clone, Default)]
pub struct LogDetail {
    pub file: Option<String>,
    pub url: Option<String>,
    pub id: Option<String>,
}

impl LogDetail {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into().to_string_lossy().replace('\\', "/")),
            ..Self::default()
        }
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    fn render(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(file) = &self.file {
            parts.push(format!("file={file}"));
        }
        if let Some(url) = &self.url {
            parts.push(format!("url={url}"));
        }
        if let Some(id) = &self.id {
            parts.push(format!("id={id}"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub status: LogStatus,
    pub message: String,
    pub detail: LogDetail,
}

#[derive(Debug, Default)]
struct FileLog {
    categories: BTreeMap<&'static str, Vec<LogEntry>>,
}

/// Append-only per-file migration record, keyed by source relative path.
/// Entries are never rewritten; both reports are derived from the same store.
#[derive(Debug, Default)]
pub struct MigrationLog {
    files: BTreeMap<String, FileLog>,
}

impl MigrationLog {
    pub fn record(
        &mut self,
        source_path: &str,
        category: LogCategory,
        status: LogStatus,
        message: impl Into<String>,
        detail: LogDetail,
    ) {
        self.files
            .entry(source_path.to_string())
            .or_default()
            .categories
            .entry(category.as_str())
            .or_default()
            .push(LogEntry {
                status,
                message: message.into(),
                detail,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.files
            .values()
            .flat_map(|file| file.categories.values())
            .flatten()
            .filter(|entry| entry.status == LogStatus::Failed)
            .count()
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Outline Migration Log\n\n");
        out.push_str(&format!("Generated: {}\n\n", Utc::now().to_rfc3339()));
        for (path, file) in &self.files {
            out.push_str(&format!("## {path}\n\n"));
            for category in LogCategory::ALL {
                let Some(entries) = file.categories.get(category.as_str()) else {
                    continue;
                };
                if entries.is_empty() {
                    continue;
                }
                out.push_str(&format!("### {}\n", category.heading()));
                for entry in entries {
                    let suffix = entry
                        .detail
                        .render()
                        .map(|detail| format!(" ({detail})"))
                        .unwrap_or_default();
                    out.push_str(&format!(
                        "- {}: {}{}\n",
                        entry.status.as_str().to_uppercase(),
                        entry.message,
                        suffix
                    ));
                }
                out.push('\n');
            }
        }
        out
    }

    /// Failures only, one row per entry. Commas in messages become
    /// semicolons so the rows stay single-line parseable.
    pub fn render_failures_csv(&self) -> String {
        let mut out = String::from("file,category,status,message,extra\n");
        for (path, file) in &self.files {
            for category in LogCategory::ALL {
                let Some(entries) = file.categories.get(category.as_str()) else {
                    continue;
                };
                for entry in entries {
                    if entry.status != LogStatus::Failed {
                        continue;
                    }
                    let message = entry.message.replace(',', ";");
                    let extra = entry
                        .detail
                        .render()
                        .map(|detail| detail.replace(", ", "; "))
                        .unwrap_or_default();
                    out.push_str(&format!(
                        "{path},{},{},{message},{extra}\n",
                        category.as_str(),
                        entry.status.as_str()
                    ));
                }
            }
        }
        out
    }

    /// Write both report files into `dir`. No-op when nothing was logged.
    pub fn write_reports(&self, dir: &Path) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let log_path = dir.join(MIGRATION_LOG_FILE);
        fs::write(&log_path, self.render_markdown())
            .with_context(|| format!("failed to write {}", log_path.display()))?;
        let csv_path = dir.join(MIGRATION_FAILURES_FILE);
        fs::write(&csv_path, self.render_failures_csv())
            .with_context(|| format!("failed to write {}", csv_path.display()))?;
        Ok(())
    }
}
