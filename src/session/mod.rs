//! Session transcript persistence.
//!
//! Transcripts are JSONL files, one message per line. Every line passes
//! through the [`crypto::SessionCipher`] on write and on read, so a store
//! with encryption enabled never leaves plaintext on disk, and a store
//! reading a mixed file (plaintext lines from before encryption was turned
//! on) still returns every message.

pub mod crypto;

pub use crypto::SessionCipher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One persisted transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
    pub timestamp_ms: u64,
}

/// Append-only JSONL transcript with encryption at rest.
pub struct TranscriptStore {
    path: PathBuf,
    cipher: Arc<SessionCipher>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl TranscriptStore {
    /// Open (or create) the transcript at `path`.
    pub fn open(path: &Path, cipher: Arc<SessionCipher>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating transcript directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening transcript {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            cipher,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// Serialize, encrypt, and append one message as a JSONL line.
    pub fn append(&self, message: &TranscriptMessage) -> Result<()> {
        let line = serde_json::to_string(message).context("serializing transcript message")?;
        let sealed = self.cipher.encrypt(&line);

        let mut guard = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("transcript writer lock poisoned: {e}"))?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("transcript writer already closed"))?;

        writeln!(writer, "{sealed}")
            .with_context(|| format!("appending to transcript {}", self.path.display()))?;
        writer.flush().context("flushing transcript")?;
        Ok(())
    }

    /// Read every message, decrypting each line. Lines that fail to parse
    /// after decryption are skipped with a warning rather than aborting the
    /// whole read.
    pub fn read_all(&self) -> Result<Vec<TranscriptMessage>> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening transcript {}", self.path.display()))?;
        let reader = BufReader::new(file);

        let mut messages = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.context("reading transcript line")?;
            if line.trim().is_empty() {
                continue;
            }
            let plain = self.cipher.decrypt(&line);
            match serde_json::from_str::<TranscriptMessage>(&plain) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(line = idx + 1, "skipping unreadable transcript line: {e}");
                }
            }
        }
        Ok(messages)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
