//! Reference and decision persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{RefineError, Result};
use crate::refine::model::{BibliographicRecord, Decision, Rid};

/// One operator change to a stored decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideEntry {
    pub kind: String,
    pub rid: Rid,
    pub before: Option<Decision>,
    pub after: Decision,
    pub at: DateTime<Utc>,
}

impl OverrideEntry {
    pub fn new(before: Option<Decision>, after: Decision) -> Self {
        Self {
            kind: "override".to_string(),
            rid: after.rid,
            before,
            after,
            at: Utc::now(),
        }
    }
}

/// Where references come from and where decisions go.
///
/// Saving a decision for a rid that already has one replaces it.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn get_reference(&self, rid: Rid) -> Result<BibliographicRecord>;

    /// The smallest rid greater than `after`, or the first rid when `after` is `None`.
    async fn next_reference_id(&self, after: Option<Rid>) -> Result<Option<Rid>>;

    async fn save_decision(&self, decision: &Decision) -> Result<()>;

    async fn get_decision(&self, rid: Rid) -> Result<Option<Decision>>;

    async fn log_override(&self, entry: &OverrideEntry) -> Result<()>;
}

/// Writes `contents` to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// References and decisions kept in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryReferenceStore {
    references: Mutex<BTreeMap<Rid, BibliographicRecord>>,
    decisions: Mutex<BTreeMap<Rid, Decision>>,
    overrides: Mutex<Vec<OverrideEntry>>,
}

impl MemoryReferenceStore {
    pub fn new(references: impl IntoIterator<Item = BibliographicRecord>) -> Self {
        let store = Self::default();
        {
            let mut map = lock(&store.references);
            for bib in references {
                map.insert(bib.rid, bib);
            }
        }
        store
    }

    pub fn decisions(&self) -> Vec<Decision> {
        lock(&self.decisions).values().cloned().collect()
    }

    pub fn overrides(&self) -> Vec<OverrideEntry> {
        lock(&self.overrides).clone()
    }
}

#[async_trait]
impl ReferenceStore for MemoryReferenceStore {
    async fn get_reference(&self, rid: Rid) -> Result<BibliographicRecord> {
        lock(&self.references)
            .get(&rid)
            .cloned()
            .ok_or(RefineError::ReferenceNotFound(rid))
    }

    async fn next_reference_id(&self, after: Option<Rid>) -> Result<Option<Rid>> {
        let references = lock(&self.references);
        Ok(match after {
            Some(rid) => references.range((Excluded(rid), Unbounded)).next().map(|(k, _)| *k),
            None => references.keys().next().copied(),
        })
    }

    async fn save_decision(&self, decision: &Decision) -> Result<()> {
        lock(&self.decisions).insert(decision.rid, decision.clone());
        Ok(())
    }

    async fn get_decision(&self, rid: Rid) -> Result<Option<Decision>> {
        Ok(lock(&self.decisions).get(&rid).cloned())
    }

    async fn log_override(&self, entry: &OverrideEntry) -> Result<()> {
        lock(&self.overrides).push(entry.clone());
        Ok(())
    }
}

/// References read from a JSON array file; decisions kept in a JSON file
/// keyed by rid and rewritten atomically on every save.
///
/// Operator overrides are appended as JSON lines to `<decisions>.overrides.jsonl`.
#[derive(Debug)]
pub struct JsonReferenceStore {
    references: BTreeMap<Rid, BibliographicRecord>,
    decisions_path: PathBuf,
    override_log_path: PathBuf,
    decisions: Mutex<BTreeMap<Rid, Decision>>,
}

impl JsonReferenceStore {
    pub fn open(references_path: &Path, decisions_path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(references_path)?;
        let records: Vec<BibliographicRecord> = serde_json::from_str(&contents)?;
        let references: BTreeMap<Rid, BibliographicRecord> = records.into_iter().map(|r| (r.rid, r)).collect();

        let decisions: BTreeMap<Rid, Decision> = if decisions_path.exists() {
            let contents = fs::read_to_string(decisions_path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                let saved: Vec<Decision> = serde_json::from_str(&contents)?;
                saved.into_iter().map(|d| (d.rid, d)).collect()
            }
        } else {
            BTreeMap::new()
        };

        let mut log = decisions_path.as_os_str().to_owned();
        log.push(".overrides.jsonl");

        info!(
            "Loaded {} references from {:?} ({} existing decisions)",
            references.len(),
            references_path,
            decisions.len()
        );

        Ok(Self {
            references,
            decisions_path: decisions_path.to_path_buf(),
            override_log_path: PathBuf::from(log),
            decisions: Mutex::new(decisions),
        })
    }

    pub fn reference_ids(&self) -> Vec<Rid> {
        self.references.keys().copied().collect()
    }

    pub fn references(&self) -> Vec<BibliographicRecord> {
        self.references.values().cloned().collect()
    }

    pub fn override_log_path(&self) -> &Path {
        &self.override_log_path
    }
}

#[async_trait]
impl ReferenceStore for JsonReferenceStore {
    async fn get_reference(&self, rid: Rid) -> Result<BibliographicRecord> {
        self.references
            .get(&rid)
            .cloned()
            .ok_or(RefineError::ReferenceNotFound(rid))
    }

    async fn next_reference_id(&self, after: Option<Rid>) -> Result<Option<Rid>> {
        Ok(match after {
            Some(rid) => self.references.range((Excluded(rid), Unbounded)).next().map(|(k, _)| *k),
            None => self.references.keys().next().copied(),
        })
    }

    async fn save_decision(&self, decision: &Decision) -> Result<()> {
        let mut decisions = lock(&self.decisions);
        let mut updated = decisions.clone();
        updated.insert(decision.rid, decision.clone());
        let contents = serde_json::to_string_pretty(&updated.values().collect::<Vec<&Decision>>())?;
        write_atomic(&self.decisions_path, &contents)?;
        *decisions = updated;
        debug!("Saved decision for reference {} to {:?}", decision.rid, self.decisions_path);
        Ok(())
    }

    async fn get_decision(&self, rid: Rid) -> Result<Option<Decision>> {
        Ok(lock(&self.decisions).get(&rid).cloned())
    }

    async fn log_override(&self, entry: &OverrideEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.override_log_path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }
}
