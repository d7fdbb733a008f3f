//! Transfer journal
//!
//! Every event goes to the `log` facade and is appended to a journal file as
//! `[<UTC timestamp>Z] <message>`. A journal file that cannot be written
//! never interrupts a transfer.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct Journal {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl Journal {
    /// Append to the journal at `path`, creating it if needed
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let writer = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                log::warn!("Cannot open journal {}: {}", path.display(), e);
                None
            }
        };

        Self {
            path: Some(path),
            writer,
        }
    }

    /// Journal that only forwards to the log facade
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an event
    pub fn record(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::info!("{}", message);
        self.append(message);
    }

    /// Record an event that needs attention
    pub fn warn(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::warn!("{}", message);
        self.append(message);
    }

    fn append(&mut self, message: &str) {
        if let Some(ref mut writer) = self.writer {
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f");
            let written = writeln!(writer, "[{}Z] {}", timestamp, message).and_then(|_| writer.flush());
            if let Err(e) = written {
                log::debug!("Journal write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_journal_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.log");

        let mut journal = Journal::open(&path);
        journal.record("Ready.");
        journal.warn("Checksum mismatch. Waiting for possible retry.");
        drop(journal);

        let mut journal = Journal::open(&path);
        journal.record("Ready.");

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("Z] Ready."));
        assert!(lines[1].ends_with("Checksum mismatch. Waiting for possible retry."));
    }

    #[test]
    fn test_unwritable_journal_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path().join("missing").join("upload.log"));
        journal.record("still running");
        assert!(journal.path().is_some());
    }
}
