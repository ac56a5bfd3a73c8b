//! Record metadata store and row id allocator.
//!
//! The store is the single source of truth for every non-vector field. It is
//! persisted as one JSON document that is rewritten through the scratch
//! directory and renamed into place on every mutation.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::fsops::{RetryPolicy, write_atomically};
use super::get_utc_timestamp;
use crate::defect::DefectRecord;
use crate::error::{KbError, KbResult};
use crate::types::RowId;

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Version of the metadata file format
const METADATA_VERSION: u32 = 1;

/// A record plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: DefectRecord,

    /// Logically deleted. The row id stays allocated forever.
    #[serde(default)]
    pub retired: bool,

    /// When the record was last written, seconds since epoch
    #[serde(default)]
    pub ingested_at: u64,
}

#[derive(Deserialize)]
struct MetadataFile {
    version: u32,
    next_id: u32,
    #[serde(default)]
    #[allow(dead_code)]
    updated_at: u64,
    #[serde(default)]
    records: BTreeMap<String, StoredRecord>,
}

#[derive(Serialize)]
struct MetadataFileRef<'a> {
    version: u32,
    next_id: u32,
    updated_at: u64,
    records: BTreeMap<String, &'a StoredRecord>,
}

/// Immutable view of every stored record, keyed by row id.
pub type MetadataSnapshot = Arc<BTreeMap<RowId, StoredRecord>>;

#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    scratch_dir: PathBuf,
    retry: RetryPolicy,
    next_id: u32,
    /// Ids handed out by the last allocation and not yet settled.
    in_flight: Range<u32>,
    records: MetadataSnapshot,
}

impl MetadataStore {
    /// Opens the store at `path`, starting empty when no file exists.
    ///
    /// An unparsable file is [`KbError::MetadataCorruption`] unless
    /// `recover_corrupt` is set, in which case the file is moved aside and the
    /// store starts empty.
    pub fn open(
        path: &Path,
        scratch_dir: &Path,
        retry: RetryPolicy,
        recover_corrupt: bool,
    ) -> KbResult<Self> {
        let mut store = Self {
            path: path.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
            retry,
            next_id: 0,
            in_flight: 0..0,
            records: Arc::new(BTreeMap::new()),
        };

        if !path.exists() {
            debug!(path = %path.display(), "no metadata file, starting empty");
            return Ok(store);
        }

        let raw = fs::read_to_string(path).map_err(|e| KbError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        match Self::parse(path, &raw) {
            Ok((next_id, records)) => {
                store.next_id = next_id;
                store.records = Arc::new(records);
                info!(
                    path = %path.display(),
                    records = store.records.len(),
                    next_id,
                    "loaded metadata store"
                );
                Ok(store)
            }
            Err(err) if recover_corrupt => {
                let aside = path.with_file_name(format!(
                    "{}.corrupt-{}",
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| METADATA_FILE_NAME.to_string()),
                    get_utc_timestamp()
                ));
                fs::rename(path, &aside).map_err(|e| KbError::FileWrite {
                    path: aside.clone(),
                    source: e,
                })?;
                error!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "metadata file is corrupt, starting with an empty store"
                );
                Ok(store)
            }
            Err(err) => Err(err),
        }
    }

    fn parse(path: &Path, raw: &str) -> KbResult<(u32, BTreeMap<RowId, StoredRecord>)> {
        let corrupt = |reason: String| KbError::MetadataCorruption {
            path: path.to_path_buf(),
            reason,
        };

        let file: MetadataFile = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
        if file.version != METADATA_VERSION {
            return Err(corrupt(format!(
                "unsupported version {} (expected {METADATA_VERSION})",
                file.version
            )));
        }

        let mut records = BTreeMap::new();
        for (key, stored) in file.records {
            let id: RowId = key
                .parse()
                .map_err(|_| corrupt(format!("invalid row id key '{key}'")))?;
            records.insert(id, stored);
        }

        let mut next_id = file.next_id;
        if let Some(max) = records.keys().next_back() {
            if max.value() >= next_id {
                warn!(
                    next_id,
                    max_id = max.value(),
                    "metadata counter behind stored ids, advancing"
                );
                next_id = max.value() + 1;
            }
        }

        Ok((next_id, records))
    }

    /// Reserves the next row id and persists the advanced counter.
    pub fn allocate_id(&mut self) -> KbResult<RowId> {
        let ids = self.allocate_ids(1)?;
        Ok(ids[0])
    }

    /// Reserves `count` consecutive row ids with a single persist.
    pub fn allocate_ids(&mut self, count: usize) -> KbResult<Vec<RowId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = self.next_id;
        let end = u32::try_from(count)
            .ok()
            .and_then(|n| start.checked_add(n))
            .ok_or_else(|| KbError::Config {
                reason: "row id space exhausted".to_string(),
            })?;

        self.next_id = end;
        if let Err(e) = self.persist() {
            self.next_id = start;
            return Err(e);
        }
        self.in_flight = start..end;
        debug!(start, end, "allocated row ids");
        Ok((start..end).map(RowId::new).collect())
    }

    /// Upserts one record. The retired flag of an existing entry is kept.
    pub fn put(&mut self, id: RowId, record: DefectRecord) -> KbResult<()> {
        self.put_many(vec![(id, record)])
    }

    /// Upserts many records with a single persist.
    pub fn put_many(&mut self, items: Vec<(RowId, DefectRecord)>) -> KbResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let previous = Arc::clone(&self.records);
        let previous_next = self.next_id;
        let now = get_utc_timestamp();
        {
            let records = Arc::make_mut(&mut self.records);
            for (id, record) in items {
                let retired = records.get(&id).map(|s| s.retired).unwrap_or(false);
                records.insert(
                    id,
                    StoredRecord {
                        record,
                        retired,
                        ingested_at: now,
                    },
                );
                if id.value() >= self.next_id {
                    self.next_id = id.value() + 1;
                }
            }
        }

        if let Err(e) = self.persist() {
            self.records = previous;
            self.next_id = previous_next;
            return Err(e);
        }
        Ok(())
    }

    /// Marks a record as logically deleted. Returns `false` if it already was.
    pub fn retire(&mut self, id: RowId) -> KbResult<bool> {
        match self.records.get(&id) {
            None => return Err(KbError::RecordNotFound { id }),
            Some(stored) if stored.retired => return Ok(false),
            Some(_) => {}
        }

        let previous = Arc::clone(&self.records);
        if let Some(stored) = Arc::make_mut(&mut self.records).get_mut(&id) {
            stored.retired = true;
        }
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e);
        }
        info!(row_id = %id, "retired record");
        Ok(true)
    }

    pub fn get(&self, id: RowId) -> Option<&DefectRecord> {
        self.records.get(&id).map(|s| &s.record)
    }

    pub fn entry(&self, id: RowId) -> Option<&StoredRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: RowId) -> bool {
        self.records.contains_key(&id)
    }

    /// Most recent row carrying `identifier`, preferring active records.
    pub fn find_by_identifier(&self, identifier: &str) -> Option<(RowId, &StoredRecord)> {
        let mut matches = self
            .records
            .iter()
            .rev()
            .filter(|(_, s)| s.record.identifier == identifier);
        let first = matches.next()?;
        if !first.1.retired {
            return Some((*first.0, first.1));
        }
        matches
            .find(|(_, s)| !s.retired)
            .or(Some(first))
            .map(|(id, s)| (*id, s))
    }

    /// Cheap immutable view for iteration during rebuilds.
    pub fn snapshot(&self) -> MetadataSnapshot {
        Arc::clone(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.records.values().filter(|s| !s.retired).count()
    }

    pub fn next_id(&self) -> RowId {
        RowId::new(self.next_id)
    }

    /// Rows allocated but not yet settled by the writer. Indices may already
    /// hold them while their records are still being stored.
    pub fn in_flight(&self) -> Range<RowId> {
        RowId::new(self.in_flight.start)..RowId::new(self.in_flight.end)
    }

    /// Ends the current allocation, whether or not its records were stored.
    pub fn settle_in_flight(&mut self) {
        self.in_flight = self.next_id..self.next_id;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> KbResult<()> {
        let file = MetadataFileRef {
            version: METADATA_VERSION,
            next_id: self.next_id,
            updated_at: get_utc_timestamp(),
            records: self
                .records
                .iter()
                .map(|(id, stored)| (id.to_key(), stored))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| KbError::FileWrite {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;
        write_atomically(&self.scratch_dir, &self.path, &json, &self.retry)
    }
}
