//! Append-only audit trail of attempt outcomes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::clock::Timestamp;
use super::identifier::IdentifierKey;
use super::window::Decision;

/// Writes one line per attempt to a log file.
///
/// Failures are logged and swallowed: the audit trail must never change
/// whether an invocation is allowed.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        at: Timestamp,
        key: &IdentifierKey,
        decision: &Decision,
        note: Option<&str>,
    ) {
        let line = format_line(at, key, decision, note);
        if let Err(e) = self.append(&line) {
            warn!(path = %self.path.display(), error = %e, "Failed to write audit log");
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

fn format_line(at: Timestamp, key: &IdentifierKey, decision: &Decision, note: Option<&str>) -> String {
    let mut line = if decision.allowed {
        format!("{} ALLOW {} remaining={}", at.to_rfc3339(), key, decision.remaining)
    } else {
        format!(
            "{} DENY {} retry_after={:.3}s",
            at.to_rfc3339(),
            key,
            decision.retry_after.as_secs_f64()
        )
    };
    // Notes are free text; keep each entry on one line.
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        line.push_str(" - ");
        line.extend(note.chars().map(|c| if c.is_control() { ' ' } else { c }));
    }
    line.push('\n');
    line
}
