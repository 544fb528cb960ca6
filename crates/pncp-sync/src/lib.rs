//! Reconciler: orchestrates fetch, normalization, merge and the
//! synchronization of review marks against the document store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use pncp_core::{normalize, Notice, Region, SavedSearch, Status, MAX_REGIONS_PER_SEARCH};
use pncp_fetch::{fetch_regions, FetchConfig, RegionFailure, SearchApi};
use pncp_store::{ReadSource, StoreError, SyncedStore, WriteOutcome};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "pncp-sync";

pub const REVIEWED_DOC: &str = "reviewed-marks";
pub const REJECTED_DOC: &str = "rejected-marks";
pub const SAVED_SEARCHES_DOC: &str = "saved-searches";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkKind {
    Reviewed,
    Rejected,
}

impl MarkKind {
    pub fn document_name(self) -> &'static str {
        match self {
            MarkKind::Reviewed => REVIEWED_DOC,
            MarkKind::Rejected => REJECTED_DOC,
        }
    }
}

/// Whether a mark toggle reached the authoritative store or only the
/// session-local fallback copy. Callers must warn on `LocalOnly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Committed,
    LocalOnly,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("search limited to {max} regions, got {got}")]
    TooManyRegions { got: usize, max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-region accounting for one search run.
#[derive(Debug, Clone, Serialize)]
pub struct RegionReport {
    pub region: Region,
    pub records: usize,
    pub skipped: usize,
    pub pages: u32,
}

/// Partial-completion report: what each region yielded, how many records
/// were skipped by normalization, and which regions failed outright.
#[derive(Debug, Default, Serialize)]
pub struct SearchReport {
    pub regions: Vec<RegionReport>,
    #[serde(skip)]
    pub failed: Vec<RegionFailure>,
    pub total_records: usize,
    pub skipped_records: usize,
}

impl SearchReport {
    pub fn failed_region_names(&self) -> Vec<String> {
        self.failed
            .iter()
            .map(|failure| failure.region.name.clone())
            .collect()
    }
}

/// Session-held view state, passed to and from the presentation boundary
/// by value. No ambient globals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub page: usize,
    pub filter: SavedSearch,
}

/// Unions per-region notice sequences, deduplicates by UID keeping the
/// first occurrence (region-processing order, then intra-region order),
/// and sorts by publication date descending with UID-ascending tie-break.
pub fn merge(per_region: Vec<Vec<Notice>>) -> Vec<Notice> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for region_notices in per_region {
        for notice in region_notices {
            if seen.insert(notice.uid.clone()) {
                merged.push(notice);
            }
        }
    }
    merged.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(a_date), Some(b_date)) => b_date.cmp(&a_date).then_with(|| a.uid.cmp(&b.uid)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.uid.cmp(&b.uid),
    });
    merged
}

fn keyword_matches(notice: &Notice, keyword_lower: &str) -> bool {
    notice.title.to_lowercase().contains(keyword_lower)
        || notice.object.to_lowercase().contains(keyword_lower)
}

#[derive(Debug, Default)]
struct MarkMaps {
    reviewed: HashMap<String, bool>,
    rejected: HashMap<String, bool>,
}

impl MarkMaps {
    fn map_mut(&mut self, kind: MarkKind) -> &mut HashMap<String, bool> {
        match kind {
            MarkKind::Reviewed => &mut self.reviewed,
            MarkKind::Rejected => &mut self.rejected,
        }
    }
}

/// Counts and degradation flag from loading the mark documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedMarks {
    pub reviewed: usize,
    pub rejected: usize,
    /// True when at least one document was served by the local fallback.
    pub degraded: bool,
}

/// Owns the merged notice collection for the duration of one query and the
/// read-your-writes copy of the mark documents between a read and its
/// matching write.
pub struct Reconciler {
    api: Arc<dyn SearchApi>,
    store: SyncedStore,
    fetch_config: FetchConfig,
    /// Held across each read-modify-write cycle so toggles never interleave.
    marks: Mutex<MarkMaps>,
    session: Mutex<SessionState>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn SearchApi>, store: SyncedStore, fetch_config: FetchConfig) -> Self {
        Self {
            api,
            store,
            fetch_config,
            marks: Mutex::new(MarkMaps::default()),
            session: Mutex::new(SessionState::default()),
        }
    }

    /// Snapshot of the session view state, handed to the presentation
    /// boundary by value.
    pub async fn session(&self) -> SessionState {
        self.session.lock().await.clone()
    }

    pub async fn set_page(&self, page: usize) {
        self.session.lock().await.page = page;
    }

    /// Reads both mark documents into the in-memory maps.
    pub async fn load_marks(&self) -> Result<LoadedMarks, StoreError> {
        let (reviewed_doc, _, reviewed_source) = self.store.read(REVIEWED_DOC).await?;
        let (rejected_doc, _, rejected_source) = self.store.read(REJECTED_DOC).await?;

        let mut maps = self.marks.lock().await;
        maps.reviewed = document_to_flags(reviewed_doc);
        maps.rejected = document_to_flags(rejected_doc);
        Ok(LoadedMarks {
            reviewed: maps.reviewed.len(),
            rejected: maps.rejected.len(),
            degraded: reviewed_source == ReadSource::LocalFallback
                || rejected_source == ReadSource::LocalFallback,
        })
    }

    /// Populates the two boolean flags on each notice; an absent UID in a
    /// map defaults to false.
    pub async fn attach_marks(&self, notices: &mut [Notice]) {
        let maps = self.marks.lock().await;
        for notice in notices {
            notice.reviewed = maps.reviewed.get(&notice.uid).copied().unwrap_or(false);
            notice.rejected = maps.rejected.get(&notice.uid).copied().unwrap_or(false);
        }
    }

    /// Sets a mark and drives the store's read-modify-write protocol.
    ///
    /// The in-memory map is updated first so the session stays consistent
    /// even when the write degrades to the local copy.
    pub async fn toggle_mark(
        &self,
        kind: MarkKind,
        uid: &str,
        value: bool,
    ) -> Result<ToggleOutcome, StoreError> {
        let mut maps = self.marks.lock().await;
        maps.map_mut(kind).insert(uid.to_string(), value);

        let message = format!("set {} for {uid} to {value}", kind.document_name());
        let uid = uid.to_string();
        let outcome = self
            .store
            .apply(kind.document_name(), &message, move |doc| {
                doc.insert(uid.clone(), JsonValue::Bool(value));
            })
            .await?;

        Ok(match outcome {
            WriteOutcome::Committed(_) => ToggleOutcome::Committed,
            WriteOutcome::LocalOnly => {
                warn!(document = kind.document_name(), "mark change is session-local only");
                ToggleOutcome::LocalOnly
            }
        })
    }

    /// Full search: fetch per region, normalize (counting skips), merge,
    /// attach marks, then filter locally by keyword. The filter runs after
    /// merge and sort, preserving the merge order among survivors.
    pub async fn run_search(
        &self,
        regions: &[Region],
        status: Option<Status>,
        keyword: &str,
    ) -> Result<(Vec<Notice>, SearchReport), ReconcileError> {
        if regions.len() > MAX_REGIONS_PER_SEARCH {
            return Err(ReconcileError::TooManyRegions {
                got: regions.len(),
                max: MAX_REGIONS_PER_SEARCH,
            });
        }

        let outcome = fetch_regions(Arc::clone(&self.api), regions, status, &self.fetch_config).await;

        let mut report = SearchReport {
            failed: outcome.failed,
            ..SearchReport::default()
        };
        let mut per_region = Vec::with_capacity(outcome.fetched.len());
        for fetch in outcome.fetched {
            let mut notices = Vec::with_capacity(fetch.records.len());
            let mut skipped = 0usize;
            for raw in &fetch.records {
                match normalize(raw) {
                    Ok(notice) => notices.push(notice),
                    Err(err) => {
                        skipped += 1;
                        debug!(region = %fetch.region.code, error = %err, "skipping record");
                    }
                }
            }
            report.total_records += notices.len();
            report.skipped_records += skipped;
            report.regions.push(RegionReport {
                region: fetch.region,
                records: notices.len(),
                skipped,
                pages: fetch.pages,
            });
            per_region.push(notices);
        }

        let mut merged = merge(per_region);
        self.attach_marks(&mut merged).await;

        let keyword = keyword.trim();
        if !keyword.is_empty() {
            let keyword_lower = keyword.to_lowercase();
            merged.retain(|notice| keyword_matches(notice, &keyword_lower));
        }

        // a fresh result set starts the session back at the first page
        let mut session = self.session.lock().await;
        session.page = 0;
        session.filter = SavedSearch {
            keyword: keyword.to_string(),
            status,
            state: None,
            regions: regions.to_vec(),
        };
        drop(session);

        Ok((merged, report))
    }

    pub async fn saved_searches(&self) -> Result<BTreeMap<String, SavedSearch>, StoreError> {
        let (document, _, _) = self.store.read(SAVED_SEARCHES_DOC).await?;
        Ok(document
            .into_iter()
            .filter_map(|(name, value)| {
                serde_json::from_value(value).ok().map(|search| (name, search))
            })
            .collect())
    }

    pub async fn save_search(
        &self,
        name: &str,
        search: &SavedSearch,
    ) -> Result<ToggleOutcome, StoreError> {
        let value = serde_json::to_value(search)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        let name_owned = name.to_string();
        let outcome = self
            .store
            .apply(SAVED_SEARCHES_DOC, &format!("save search {name}"), move |doc| {
                doc.insert(name_owned.clone(), value.clone());
            })
            .await?;
        Ok(collapse_outcome(outcome))
    }

    pub async fn delete_search(&self, name: &str) -> Result<ToggleOutcome, StoreError> {
        let name_owned = name.to_string();
        let outcome = self
            .store
            .apply(SAVED_SEARCHES_DOC, &format!("delete search {name}"), move |doc| {
                doc.remove(&name_owned);
            })
            .await?;
        Ok(collapse_outcome(outcome))
    }
}

fn collapse_outcome(outcome: WriteOutcome) -> ToggleOutcome {
    match outcome {
        WriteOutcome::Committed(_) => ToggleOutcome::Committed,
        WriteOutcome::LocalOnly => ToggleOutcome::LocalOnly,
    }
}

fn document_to_flags(document: pncp_store::Document) -> HashMap<String, bool> {
    document
        .into_iter()
        .map(|(uid, value)| (uid, value.as_bool().unwrap_or(false)))
        .collect()
}
