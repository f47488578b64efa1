//! Champion and result persistence.
//!
//! The backing document store is external to the evolution core; these
//! traits are the narrow surface the orchestrator relies on. Callers must
//! not assume a `save_champion` is visible to an immediate `load_champion`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::record::{Champion, EvaluationRecord};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait ChampionStore: Send + Sync {
    /// `None` before the first promotion.
    async fn load_champion(&self) -> Result<Option<Champion>>;

    async fn save_champion(&self, champion: &Champion) -> Result<()>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create-or-overwrite by record id.
    async fn append_record(&self, record: &EvaluationRecord) -> Result<()>;

    async fn load_record(&self, id: &str) -> Result<Option<EvaluationRecord>>;

    /// Newest first.
    async fn recent_records(&self, limit: usize) -> Result<Vec<EvaluationRecord>>;

    /// Records created strictly after `since`, newest first.
    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<EvaluationRecord>>;

    async fn save_survivors(&self, survivors: &[EvaluationRecord]) -> Result<()>;

    async fn load_survivors(&self) -> Result<Vec<EvaluationRecord>>;

    /// Delete records that are both outside the newest `keep_latest` and
    /// created before `older_than`. Returns how many were removed.
    async fn prune(&self, keep_latest: usize, older_than: DateTime<Utc>) -> Result<usize>;
}

/// Everything the orchestrator needs from one backing store.
pub trait EvolutionStore: ChampionStore + ResultStore {}

impl<T: ChampionStore + ResultStore> EvolutionStore for T {}

fn newest_first(records: &mut [EvaluationRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn prune_victims(
    mut records: Vec<EvaluationRecord>,
    keep_latest: usize,
    older_than: DateTime<Utc>,
) -> Vec<String> {
    newest_first(&mut records);
    records
        .into_iter()
        .skip(keep_latest)
        .filter(|r| r.created_at < older_than)
        .map(|r| r.id)
        .collect()
}

/// Directory-backed document store.
///
/// Layout: `results/<id>.json`, `champion.json`, `survivors.json`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("results")).await?;
        Ok(Self { root })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join("results").join(format!("{safe}.json"))
    }

    fn champion_path(&self) -> PathBuf {
        self.root.join("champion.json")
    }

    fn survivors_path(&self) -> PathBuf {
        self.root.join("survivors.json")
    }

    /// Unreadable documents are logged and skipped.
    async fn all_records(&self) -> Result<Vec<EvaluationRecord>> {
        let mut out = Vec::new();
        let mut dir = fs::read_dir(self.root.join("results")).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<EvaluationRecord>(&path).await {
                Ok(Some(rec)) => out.push(rec),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record");
                }
            }
        }
        Ok(out)
    }
}

/// Write via a sibling temp file and rename so readers never see a torn document.
async fn write_json_atomic<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ChampionStore for JsonFileStore {
    async fn load_champion(&self) -> Result<Option<Champion>> {
        read_json(&self.champion_path()).await
    }

    async fn save_champion(&self, champion: &Champion) -> Result<()> {
        write_json_atomic(&self.champion_path(), champion).await?;
        debug!(source = %champion.source_id, fitness = champion.fitness, "champion written");
        Ok(())
    }
}

#[async_trait]
impl ResultStore for JsonFileStore {
    async fn append_record(&self, record: &EvaluationRecord) -> Result<()> {
        write_json_atomic(&self.record_path(&record.id), record).await
    }

    async fn load_record(&self, id: &str) -> Result<Option<EvaluationRecord>> {
        read_json(&self.record_path(id)).await
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<EvaluationRecord>> {
        let mut records = self.all_records().await?;
        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<EvaluationRecord>> {
        let mut records: Vec<_> = self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.created_at > since)
            .collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn save_survivors(&self, survivors: &[EvaluationRecord]) -> Result<()> {
        write_json_atomic(&self.survivors_path(), survivors).await
    }

    async fn load_survivors(&self) -> Result<Vec<EvaluationRecord>> {
        Ok(read_json(&self.survivors_path()).await?.unwrap_or_default())
    }

    async fn prune(&self, keep_latest: usize, older_than: DateTime<Utc>) -> Result<usize> {
        let victims = prune_victims(self.all_records().await?, keep_latest, older_than);
        for id in &victims {
            fs::remove_file(self.record_path(id)).await?;
        }
        Ok(victims.len())
    }
}

#[derive(Default)]
struct MemoryState {
    champion: Option<Champion>,
    records: HashMap<String, EvaluationRecord>,
    survivors: Vec<EvaluationRecord>,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChampionStore for MemoryStore {
    async fn load_champion(&self) -> Result<Option<Champion>> {
        Ok(self.state.read().await.champion.clone())
    }

    async fn save_champion(&self, champion: &Champion) -> Result<()> {
        self.state.write().await.champion = Some(champion.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append_record(&self, record: &EvaluationRecord) -> Result<()> {
        self.state
            .write()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_record(&self, id: &str) -> Result<Option<EvaluationRecord>> {
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<EvaluationRecord>> {
        let mut records: Vec<_> = self.state.read().await.records.values().cloned().collect();
        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<EvaluationRecord>> {
        let mut records: Vec<_> = self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|r| r.created_at > since)
            .cloned()
            .collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn save_survivors(&self, survivors: &[EvaluationRecord]) -> Result<()> {
        self.state.write().await.survivors = survivors.to_vec();
        Ok(())
    }

    async fn load_survivors(&self) -> Result<Vec<EvaluationRecord>> {
        Ok(self.state.read().await.survivors.clone())
    }

    async fn prune(&self, keep_latest: usize, older_than: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let all = state.records.values().cloned().collect();
        let victims = prune_victims(all, keep_latest, older_than);
        for id in &victims {
            state.records.remove(id);
        }
        Ok(victims.len())
    }
}
