//! Append-only message log.
//!
//! Layout on disk (when a path is given):
//! ```text
//! {path}            one JSON-serialized Message per line
//! ```
//!
//! Appends are serialized behind a single writer lock, written and fsynced
//! before they become visible to readers. Readers only take a shared lock, so
//! they never block each other.
//!
//! An id is spent once an entry is sealed. A durable write that fails is cut
//! back off the file, and its id is never handed out again.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ConclaveError, Result};
use crate::protocol::{Message, MessageDraft, MessageId};

/// The single source of truth for inter-agent communication
pub struct MessageLog {
    entries: RwLock<Vec<Message>>,
    /// Writer lock; holds the open file for durable logs
    writer: Mutex<Writer>,
    path: Option<PathBuf>,
    read_only: bool,
}

struct Writer {
    file: Option<File>,
    next_id: MessageId,
}

impl Writer {
    fn new(file: Option<File>, entries: &[Message]) -> Self {
        Self {
            file,
            next_id: entries.last().map_or(MessageId(1), |m| m.id.next()),
        }
    }
}

impl MessageLog {
    /// Log kept only in memory
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            writer: Mutex::new(Writer::new(None, &[])),
            path: None,
            read_only: false,
        }
    }

    /// Open (or create) a durable JSONL log, recovering existing entries
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let (entries, needs_newline) = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let torn = !content.is_empty() && !content.ends_with('\n');
            (Self::recover(&path, &content), torn)
        } else {
            (Vec::new(), false)
        };

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if needs_newline {
            // Terminate a torn trailing write so the next entry starts clean.
            writeln!(file)?;
        }

        info!(path = %path.display(), entries = entries.len(), "Opened message log");

        Ok(Self {
            writer: Mutex::new(Writer::new(Some(file), &entries)),
            entries: RwLock::new(entries),
            path: Some(path),
            read_only: false,
        })
    }

    /// Load an existing durable log without opening it for writing.
    ///
    /// The file is left exactly as found, torn tail included; appends fail.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path)?;
        let entries = Self::recover(&path, &content);
        debug!(path = %path.display(), entries = entries.len(), "Loaded message log read-only");

        Ok(Self {
            writer: Mutex::new(Writer::new(None, &entries)),
            entries: RwLock::new(entries),
            path: Some(path),
            read_only: true,
        })
    }

    fn recover(path: &Path, content: &str) -> Vec<Message> {
        let mut entries: Vec<Message> = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => {
                    // Duplicate or out-of-order ids come from replayed writes; keep the first.
                    if entries.last().is_some_and(|last| message.id <= last.id) {
                        debug!(id = %message.id, "Skipping duplicate log entry");
                        continue;
                    }
                    entries.push(message);
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable log entry"
                    );
                }
            }
        }
        entries
    }

    /// Append a draft; the only operation that can fail a publish
    pub fn append(&self, draft: MessageDraft) -> Result<Message> {
        if self.read_only {
            return Err(ConclaveError::Validation("message log is read-only".into()));
        }
        let mut writer = self.writer.lock();

        let id = writer.next_id;
        let floor = self.entries.read().last().map(|m| m.timestamp);
        // Timestamps never go backwards, even if the wall clock does.
        let now = Utc::now();
        let timestamp = floor.map_or(now, |floor| floor.max(now));

        let message = draft.seal(id, timestamp)?;
        writer.next_id = id.next();

        if let Some(file) = writer.file.as_mut() {
            let line = serde_json::to_string(&message)?;
            Self::write_line(file, &line)?;
        }

        self.entries.write().push(message.clone());
        Ok(message)
    }

    /// Write and fsync one line, or leave the file as it was
    fn write_line(file: &mut File, line: &str) -> Result<()> {
        let len = file.metadata()?.len();
        if let Err(e) = writeln!(file, "{line}").and_then(|()| file.sync_data()) {
            if let Err(rollback) = file.set_len(len) {
                warn!(error = %rollback, "Could not cut back a failed log write");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Entries appended after `after` (all entries when `None`), in append order
    pub fn read_from(&self, after: Option<MessageId>) -> Vec<Message> {
        let entries = self.entries.read();
        let start = match after {
            Some(after) => entries.partition_point(|m| m.id <= after),
            None => 0,
        };
        entries[start..].to_vec()
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        let entries = self.entries.read();
        entries
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| entries[idx].clone())
    }

    pub fn last_id(&self) -> Option<MessageId> {
        self.entries.read().last().map(|m| m.id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Backing file, if durable
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::in_memory()
    }
}
