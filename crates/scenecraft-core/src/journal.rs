//! Run journal
//!
//! Every pass attempt is recorded as a [`PassRecord`] and appended to a
//! hash chain: each [`JournalEntry`] stores the SHA-256 of its record and of
//! the previous entry's hash, so any edit or reordering breaks verification.
//! With a directory configured, entries are also written as JSON lines and
//! each pass leaves its generated code and a context snapshot next to them.

use crate::context::Context;
use crate::error::PipelineError;
use crate::graph::GraphMode;
use crate::stages::StageKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt as _;
use ulid::Ulid;

const JOURNAL_FILE: &str = "journal.jsonl";
const GENESIS: [u8; 32] = [0u8; 32];

/// How a pass attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// One pass attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass: u32,
    pub attempt: u32,
    pub mode: GraphMode,
    pub outcome: PassOutcome,
    pub stage: Option<StageKind>,
    pub error: Option<String>,
    pub image_source: Option<PathBuf>,
    /// SHA-256 of the serialized context after the attempt
    pub context_digest: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PassRecord {
    /// Record for an attempt that left `ctx` behind
    #[must_use]
    pub fn new(pass: u32, attempt: u32, mode: GraphMode, outcome: PassOutcome, ctx: &Context) -> Self {
        Self {
            pass,
            attempt,
            mode,
            outcome,
            stage: None,
            error: None,
            image_source: ctx.image_source().map(Path::to_path_buf),
            context_digest: context_digest(ctx),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn failed_in(mut self, stage: Option<StageKind>, error: &PipelineError) -> Self {
        self.stage = stage;
        self.error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn timed(mut self, started_at: DateTime<Utc>, duration_ms: u64) -> Self {
        self.started_at = started_at;
        self.duration_ms = duration_ms;
        self
    }
}

/// Hex SHA-256 of a context's JSON form
#[must_use]
pub fn context_digest(ctx: &Context) -> String {
    let bytes = serde_json::to_vec(ctx).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Chained journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub record: PassRecord,
    #[serde(with = "hex_bytes")]
    pub prev_hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub hash: [u8; 32],
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(text, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

fn compute_hash(sequence: u64, record: &PassRecord, prev_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(serde_json::to_vec(record).unwrap_or_default());
    hasher.update([0]);
    hasher.update(prev_hash);
    hasher.finalize().into()
}

fn verify_chain<'a>(entries: impl IntoIterator<Item = &'a JournalEntry>) -> Result<usize, PipelineError> {
    let mut prev = GENESIS;
    let mut count = 0;
    for (expected_seq, entry) in entries.into_iter().enumerate() {
        if entry.sequence != expected_seq as u64 || entry.prev_hash != prev {
            return Err(PipelineError::Journal(format!(
                "chain broken at entry {}",
                entry.sequence
            )));
        }
        if entry.hash != compute_hash(entry.sequence, &entry.record, &entry.prev_hash) {
            return Err(PipelineError::Journal(format!(
                "hash mismatch at entry {}",
                entry.sequence
            )));
        }
        prev = entry.hash;
        count += 1;
    }
    Ok(count)
}

fn journal_error(action: &str, path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Journal(format!("{action} {}: {e}", path.display()))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| journal_error("cannot write", path, e))
}

/// Append-only pass journal of one run
#[derive(Debug)]
pub struct RunJournal {
    run_id: Ulid,
    dir: Option<PathBuf>,
    entries: Mutex<Vec<JournalEntry>>,
    /// Serialises appends so file lines follow chain order
    writer: tokio::sync::Mutex<()>,
}

impl RunJournal {
    /// Journal kept in memory only
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            run_id: Ulid::new(),
            dir: None,
            entries: Mutex::new(Vec::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Journal persisted under `root/<run id>/`
    ///
    /// # Errors
    /// `PipelineError::Journal` if the directory cannot be created.
    pub async fn create(root: &Path) -> Result<Self, PipelineError> {
        let run_id = Ulid::new();
        let dir = root.join(run_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| journal_error("cannot create", &dir, e))?;
        tracing::info!(dir = %dir.display(), "run journal created");
        Ok(Self {
            run_id,
            dir: Some(dir),
            entries: Mutex::new(Vec::new()),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    #[inline]
    #[must_use]
    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    /// Run directory, if persisted
    #[inline]
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Chain and store a record
    ///
    /// # Errors
    /// `PipelineError::Journal` if the journal file cannot be written.
    pub async fn append(&self, record: PassRecord) -> Result<JournalEntry, PipelineError> {
        let _writer = self.writer.lock().await;
        let (sequence, prev_hash) = {
            let entries = self.entries.lock();
            (entries.len() as u64, entries.last().map_or(GENESIS, |e| e.hash))
        };
        let hash = compute_hash(sequence, &record, &prev_hash);
        let entry = JournalEntry {
            sequence,
            record,
            prev_hash,
            hash,
        };

        if let Some(dir) = &self.dir {
            let path = dir.join(JOURNAL_FILE);
            let mut line = serde_json::to_string(&entry)
                .map_err(|e| journal_error("cannot encode entry for", &path, e))?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| journal_error("cannot open", &path, e))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| journal_error("cannot append to", &path, e))?;
            file.flush()
                .await
                .map_err(|e| journal_error("cannot flush", &path, e))?;
        }

        self.entries.lock().push(entry.clone());
        Ok(entry)
    }

    /// Save the generated code and a context snapshot of one attempt
    ///
    /// # Errors
    /// `PipelineError::Journal` on write failure.
    pub async fn save_artifacts(&self, ctx: &Context, attempt: u32) -> Result<(), PipelineError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let pass_dir = dir.join(format!("pass-{:02}-attempt-{attempt}", ctx.pass()));
        tokio::fs::create_dir_all(&pass_dir)
            .await
            .map_err(|e| journal_error("cannot create", &pass_dir, e))?;

        if let Some(code) = ctx.generated_code() {
            write_file(&pass_dir.join("generated.py"), code.as_bytes()).await?;
        }
        let path = pass_dir.join("context.json");
        let snapshot = serde_json::to_vec_pretty(ctx)
            .map_err(|e| journal_error("cannot encode", &path, e))?;
        write_file(&path, &snapshot).await
    }

    /// Persist the final context of the run
    ///
    /// # Errors
    /// `PipelineError::Journal` on write failure.
    pub async fn save_final(&self, ctx: &Context) -> Result<(), PipelineError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join("final-context.json");
        let snapshot = serde_json::to_vec_pretty(ctx)
            .map_err(|e| journal_error("cannot encode", &path, e))?;
        write_file(&path, &snapshot).await
    }

    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Verify the in-memory chain
    ///
    /// # Errors
    /// `PipelineError::Journal` naming the first broken entry.
    pub fn verify_integrity(&self) -> Result<usize, PipelineError> {
        verify_chain(self.entries.lock().iter())
    }

    /// Verify a journal file written by [`RunJournal::append`]
    ///
    /// # Errors
    /// `PipelineError::Journal` if the file is unreadable, a line does not
    /// decode, or the chain is broken.
    pub fn verify_file(path: &Path) -> Result<usize, PipelineError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| journal_error("cannot read", path, e))?;
        let entries = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<JournalEntry>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| journal_error("cannot decode", path, e))?;
        verify_chain(&entries)
    }

    /// Path of the JSON-lines file, if persisted
    #[must_use]
    pub fn file(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(JOURNAL_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageOutput;

    fn record(pass: u32, outcome: PassOutcome) -> PassRecord {
        let ctx = Context::new("a red cube", "").unwrap();
        PassRecord::new(pass, 1, GraphMode::Initial, outcome, &ctx)
    }

    #[tokio::test]
    async fn chain_links_entries() {
        let journal = RunJournal::in_memory();
        let first = journal.append(record(1, PassOutcome::Completed)).await.unwrap();
        let second = journal.append(record(2, PassOutcome::Completed)).await.unwrap();

        assert_eq!(first.prev_hash, GENESIS);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(journal.verify_integrity().unwrap(), 2);
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let journal = RunJournal::in_memory();
        journal.append(record(1, PassOutcome::Failed)).await.unwrap();
        journal.append(record(1, PassOutcome::Completed)).await.unwrap();

        let mut entries = journal.entries();
        entries[0].record.outcome = PassOutcome::Completed;
        assert!(verify_chain(&entries).is_err());
    }

    #[test]
    fn digest_tracks_context_changes() {
        let mut ctx = Context::new("a red cube", "").unwrap();
        let before = context_digest(&ctx);
        ctx.apply(StageOutput::GeneratedCode("import bpy".into()));
        assert_ne!(before, context_digest(&ctx));
        assert_eq!(before.len(), 64);
    }

    #[tokio::test]
    async fn persisted_journal_verifies_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let journal = RunJournal::create(root.path()).await.unwrap();
        journal.append(record(1, PassOutcome::Completed)).await.unwrap();
        journal
            .append(record(2, PassOutcome::Failed).failed_in(
                Some(StageKind::Vision),
                &PipelineError::external("vision model", "503"),
            ))
            .await
            .unwrap();

        let file = journal.file().unwrap();
        assert_eq!(RunJournal::verify_file(&file).unwrap(), 2);

        let text = std::fs::read_to_string(&file).unwrap();
        let tampered = text.replacen("\"failed\"", "\"completed\"", 1);
        std::fs::write(&file, tampered).unwrap();
        assert!(RunJournal::verify_file(&file).is_err());
    }

    #[tokio::test]
    async fn artifacts_are_saved_per_attempt() {
        let root = tempfile::tempdir().unwrap();
        let journal = RunJournal::create(root.path()).await.unwrap();
        let mut ctx = Context::new("a red cube", "").unwrap();
        ctx.apply(StageOutput::GeneratedCode("import bpy".into()));

        journal.save_artifacts(&ctx, 2).await.unwrap();
        journal.save_final(&ctx).await.unwrap();

        let dir = journal.dir().unwrap();
        let code = std::fs::read_to_string(dir.join("pass-01-attempt-2/generated.py")).unwrap();
        assert_eq!(code, "import bpy");
        assert!(dir.join("pass-01-attempt-2/context.json").exists());
        assert!(dir.join("final-context.json").exists());
    }
}
