use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EntityId, Identity, VersionToken};
use crate::error::MirrorError;

const SERIES_FILE: &str = "series.jsonl";
const SAMPLES_FILE: &str = "samples.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Entity,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub kind: RecordKind,
    pub entity: EntityId,
    pub identity: Identity,
    pub remote_address: String,
    pub durable_path: String,
    pub status: String,
    pub remote_modified: DateTime<Utc>,
    pub version: VersionToken,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerState {
    records: Vec<LedgerRecord>,
    series: File,
    samples: File,
}

#[derive(Debug)]
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn open(dir: &Utf8Path) -> Result<Self, MirrorError> {
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| MirrorError::Ledger(format!("create {dir}: {err}")))?;
        let series_path = dir.join(SERIES_FILE);
        let samples_path = dir.join(SAMPLES_FILE);

        let mut records = read_records(&series_path)?;
        records.extend(read_records(&samples_path)?);

        Ok(Self {
            state: Mutex::new(LedgerState {
                records,
                series: open_append(&series_path)?,
                samples: open_append(&samples_path)?,
            }),
        })
    }

    pub fn append(&self, record: LedgerRecord) -> Result<(), MirrorError> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|err| MirrorError::Ledger(err.to_string()))?;
        line.push(b'\n');

        let mut state = self.lock()?;
        let file = match record.kind {
            RecordKind::Entity => &mut state.series,
            RecordKind::Member => &mut state.samples,
        };
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|err| MirrorError::Ledger(format!("append: {err}")))?;
        state.records.push(record);
        Ok(())
    }

    pub fn latest(&self, identity: &Identity) -> Result<Option<LedgerRecord>, MirrorError> {
        Ok(self.history(identity)?.pop())
    }

    pub fn history(&self, identity: &Identity) -> Result<Vec<LedgerRecord>, MirrorError> {
        let state = self.lock()?;
        let mut matching = state
            .records
            .iter()
            .filter(|record| &record.identity == identity)
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by_key(|record| (record.version, record.recorded_at));
        Ok(matching)
    }

    pub fn entities_seen(&self) -> Result<BTreeSet<EntityId>, MirrorError> {
        let state = self.lock()?;
        Ok(state
            .records
            .iter()
            .map(|record| record.entity.clone())
            .collect())
    }

    pub fn records(&self) -> Result<Vec<LedgerRecord>, MirrorError> {
        Ok(self.lock()?.records.clone())
    }

    pub fn len(&self) -> Result<usize, MirrorError> {
        Ok(self.lock()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool, MirrorError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, MirrorError> {
        self.state
            .lock()
            .map_err(|_| MirrorError::Ledger("ledger lock poisoned".to_string()))
    }
}

fn open_append(path: &Utf8Path) -> Result<File, MirrorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .map_err(|err| MirrorError::Ledger(format!("open {path}: {err}")))
}

// A crash mid-append can leave an unterminated last line. If it does not
// parse it is cut off; if it does, the missing newline is restored. Any
// other malformed line is an error.
fn read_records(path: &Utf8Path) -> Result<Vec<LedgerRecord>, MirrorError> {
    if !path.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let content = fs::read(path.as_std_path())
        .map_err(|err| MirrorError::Ledger(format!("read {path}: {err}")))?;
    let mut records = Vec::new();
    let mut offset = 0u64;
    for (index, line) in content.split_inclusive(|byte| *byte == b'\n').enumerate() {
        let start = offset;
        offset += line.len() as u64;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let terminated = line.ends_with(b"\n");
        match serde_json::from_slice::<LedgerRecord>(line) {
            Ok(record) => {
                if !terminated {
                    terminate_last_line(path)?;
                }
                records.push(record);
            }
            Err(err) if !terminated => {
                tracing::warn!(%path, line = index + 1, error = %err, "dropping torn ledger line");
                truncate(path, start)?;
            }
            Err(err) => {
                return Err(MirrorError::Ledger(format!("{path}:{}: {err}", index + 1)));
            }
        }
    }
    Ok(records)
}

fn truncate(path: &Utf8Path, len: u64) -> Result<(), MirrorError> {
    OpenOptions::new()
        .write(true)
        .open(path.as_std_path())
        .and_then(|file| file.set_len(len))
        .map_err(|err| MirrorError::Ledger(format!("truncate {path}: {err}")))
}

fn terminate_last_line(path: &Utf8Path) -> Result<(), MirrorError> {
    open_append(path)?
        .write_all(b"\n")
        .map_err(|err| MirrorError::Ledger(format!("append {path}: {err}")))
}
