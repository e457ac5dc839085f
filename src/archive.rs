use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

use crate::train::Train;

pub const ARCHIVE_PATH: &str = "trains.hash";

/// What the reconciliation loop should do with a scraped train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Never seen before, send it.
    NotTracked,
    /// Seen before but the fingerprint differs, edit the old message.
    Changed,
    /// Already sent and identical, nothing to do.
    Unchanged,
}

/// Entry persisted per train, keyed by [`Train::unique_id`].
///
/// `message_id` 0 means the train was never actually delivered (dry run);
/// the wire names match the persisted JSON format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    #[serde(rename = "MessageID")]
    pub message_id: i64,
    #[serde(rename = "TrainHash")]
    pub train_hash: String,
}

/// Persisted identity -> (message id, fingerprint) mapping.
///
/// Loaded fully at startup; the in-memory copy is authoritative for the
/// process lifetime and is only mutated by the reconciliation loop. Entries
/// are never deleted, so a train that drops off the listing and later
/// reappears unchanged is not re-announced.
#[derive(Debug, Default)]
pub struct TrainArchive {
    entries: BTreeMap<String, ArchiveEntry>,
    dirty: bool,
}

impl TrainArchive {
    pub fn load(reader: impl Read) -> Result<Self> {
        let entries = serde_json::from_reader(reader).wrap_err("train archive is corrupt")?;
        Ok(Self {
            entries,
            dirty: false,
        })
    }

    /// Loads the archive, creating an empty one when the file is missing.
    /// A present but unreadable file is a fatal error.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            fs::write(path, "{}")
                .wrap_err_with(|| format!("cannot create archive {}", path.display()))?;
        }
        let file = fs::File::open(path)
            .wrap_err_with(|| format!("cannot open archive {}", path.display()))?;
        Self::load(file)
    }

    /// Full rewrite of the destination, skipped when nothing changed since
    /// the last save. Failures leave the archive dirty so the next cycle
    /// retries the write.
    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, json)
            .wrap_err_with(|| format!("cannot write archive {}", path.display()))?;
        self.dirty = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Message id recorded for a train, 0 when absent or never delivered.
    pub fn message_id(&self, id: &str) -> i64 {
        self.entries.get(id).map_or(0, |e| e.message_id)
    }

    /// Inserts or overwrites the entry for `id`. Idempotent.
    pub fn record(&mut self, id: &str, message_id: i64, fingerprint: String) {
        self.entries.insert(
            id.to_string(),
            ArchiveEntry {
                message_id,
                train_hash: fingerprint,
            },
        );
        self.dirty = true;
    }

    /// Pure three-way comparison of a scraped train against the archive.
    pub fn compare(&self, train: &Train) -> Comparison {
        match self.entries.get(&train.unique_id()) {
            None => Comparison::NotTracked,
            Some(entry) if entry.train_hash != train.fingerprint() => Comparison::Changed,
            Some(_) => Comparison::Unchanged,
        }
    }
}
