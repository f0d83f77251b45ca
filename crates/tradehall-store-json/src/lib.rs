#![allow(clippy::missing_errors_doc)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use tradehall_core::{
    format_rfc3339, now_utc, plan_rating_migration, resolve_target_role, summarize_rep,
    CreateEscortRequest, CreateQuestRequest, CreateTradeRequest, EscortRecord, EscortStatus,
    ItemCatalog, LegacyRating, QuestRecord, QuestStatus, RatingRecord, RatingSentiment,
    RatingTargetRole, RecordSelector, RepEntry, RepSource, RepSourceType, RepSummary,
    SubmitRatingRequest, TradeItemMatch, TradeRecord, TradeStatus, TradehallError,
    UpdateTradeItemsRequest,
};
use ulid::Ulid;

/// Lease markers older than this are presumed abandoned by a crashed holder.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

const RATING_POSITIVE_REASON: &str = "Positive trade review";
const RATING_NEGATIVE_REASON: &str = "Negative trade review";
const ESCORT_REWARD_REASON: &str = "Escort mission completed";

/// Whole-collection JSON file store.
///
/// `read` favors availability: a missing or unparsable backing file yields
/// the default value (unparsable files are logged). `write` persists the
/// entire value and fails loudly. `update` serializes read-mutate-write
/// against other `update` calls from this process only; two processes racing
/// on the same file can still lose one write to the other.
pub struct JsonStore<T> {
    path: PathBuf,
    update_lock: Mutex<()>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            update_lock: Mutex::new(()),
            _marker: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the full collection, defaulting to empty when the backing file
    /// is missing or cannot be parsed.
    #[must_use]
    pub fn read(&self) -> T {
        match fs::read_to_string(&self.path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "collection file is unparsable, treating as empty"
                    );
                    T::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "collection file is unreadable, treating as empty"
                );
                T::default()
            }
        }
    }

    /// Persists the whole collection, replacing the file atomically.
    pub fn write(&self, value: &T) -> Result<()> {
        let body = serde_json::to_string_pretty(value).with_context(|| {
            format!("failed to serialize collection for {}", self.path.display())
        })?;
        write_atomic(&self.path, &body)
    }

    /// Read, apply the mutator, write back, as one logical step. Serialized
    /// against other `update` calls on this instance; there is no
    /// cross-process atomicity.
    pub fn update<F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let _guard = self
            .update_lock
            .lock()
            .map_err(|_| anyhow!("update lock poisoned for {}", self.path.display()))?;
        let mut current = self.read();
        mutator(&mut current);
        self.write(&current)?;
        Ok(current)
    }
}

fn write_atomic(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }

    // Write a sibling temp file first so a crash mid-write never leaves a
    // truncated collection behind.
    let tmp = path.with_file_name(format!("{}.tmp", Ulid::new()));
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create temp file {}", tmp.display()))?;
        file.write_all(body.as_bytes())
            .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace collection file {}", path.display()))?;
    Ok(())
}

/// Access to the identifying fields shared by every task record.
pub trait StoredRecord {
    fn id(&self) -> Ulid;
    fn interaction_id(&self) -> Option<&str>;
    fn thread_id(&self) -> &str;
}

impl StoredRecord for TradeRecord {
    fn id(&self) -> Ulid {
        self.id
    }

    fn interaction_id(&self) -> Option<&str> {
        self.interaction_id.as_deref()
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl StoredRecord for EscortRecord {
    fn id(&self) -> Ulid {
        self.id
    }

    fn interaction_id(&self) -> Option<&str> {
        self.interaction_id.as_deref()
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl StoredRecord for QuestRecord {
    fn id(&self) -> Ulid {
        self.id
    }

    fn interaction_id(&self) -> Option<&str> {
        self.interaction_id.as_deref()
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

/// Durable collection of task records with linear-scan lookups. Collections
/// stay small enough that an index would be overhead without benefit.
pub struct RecordStore<R> {
    store: JsonStore<Vec<R>>,
}

impl<R> RecordStore<R>
where
    R: StoredRecord + Serialize + DeserializeOwned + Clone,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<R> {
        self.store.read()
    }

    #[must_use]
    pub fn get_by_id(&self, id: Ulid) -> Option<R> {
        self.store.read().into_iter().find(|record| record.id() == id)
    }

    #[must_use]
    pub fn get_by_thread_id(&self, thread_id: &str) -> Option<R> {
        self.store
            .read()
            .into_iter()
            .find(|record| record.thread_id() == thread_id)
    }

    #[must_use]
    pub fn get_by_interaction_id(&self, interaction_id: &str) -> Option<R> {
        self.store
            .read()
            .into_iter()
            .find(|record| record.interaction_id() == Some(interaction_id))
    }

    /// Appends a record; insertion order is the only ordering the
    /// collection maintains.
    pub fn save(&self, record: R) -> Result<()> {
        self.store.update(|records| records.push(record))?;
        Ok(())
    }

    /// Applies `updater` to the record with the given id, returning the
    /// updated record, or `None` when no such record exists.
    pub fn update_record<F>(&self, id: Ulid, updater: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut R),
    {
        let mut updated = None;
        self.store.update(|records| {
            if let Some(record) = records.iter_mut().find(|record| record.id() == id) {
                updater(record);
                updated = Some(record.clone());
            }
        })?;
        Ok(updated)
    }
}

/// Trade reviews, at most one per `(trade_id, target_role)`.
pub struct RatingStore {
    store: JsonStore<Vec<RatingRecord>>,
}

impl RatingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<RatingRecord> {
        self.store.read()
    }

    #[must_use]
    pub fn find_by_trade_and_role(
        &self,
        trade_id: Ulid,
        target_role: RatingTargetRole,
    ) -> Option<RatingRecord> {
        self.store
            .read()
            .into_iter()
            .find(|rating| rating.trade_id == trade_id && rating.target_role == target_role)
    }

    #[must_use]
    pub fn has_rating(&self, trade_id: Ulid, target_role: RatingTargetRole) -> bool {
        self.find_by_trade_and_role(trade_id, target_role).is_some()
    }

    pub fn add(&self, rating: RatingRecord) -> Result<()> {
        self.store.update(|ratings| ratings.push(rating))?;
        Ok(())
    }
}

/// Append-only reputation ledger. Entries are never mutated or deleted;
/// summaries are recomputed from the full entry list on demand.
pub struct RepStore {
    store: JsonStore<Vec<RepEntry>>,
}

impl RepStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<RepEntry> {
        self.store.read()
    }

    #[must_use]
    pub fn list_by_user(&self, user_id: &str) -> Vec<RepEntry> {
        self.store
            .read()
            .into_iter()
            .filter(|entry| entry.user_id == user_id)
            .collect()
    }

    pub fn add(&self, entry: RepEntry) -> Result<()> {
        self.store.update(|entries| entries.push(entry))?;
        Ok(())
    }

    pub fn add_all(&self, new_entries: Vec<RepEntry>) -> Result<()> {
        self.store
            .update(|entries| entries.extend(new_entries))?;
        Ok(())
    }

    #[must_use]
    pub fn summary_for_user(&self, user_id: &str) -> RepSummary {
        summarize_rep(user_id, &self.store.read())
    }
}

/// Cross-process exclusive grant keyed by an external request id.
///
/// Acquisition is single-shot and non-blocking: callers that lose tell the
/// user to retry rather than queueing. Marker modification time is the sole
/// staleness clock.
pub struct LeaseDir {
    dir: PathBuf,
    ttl: Duration,
}

impl LeaseDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, DEFAULT_LEASE_TTL)
    }

    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Attempts to take the exclusive marker for `request_id`.
    ///
    /// Returns `Ok(None)` on contention: a live holder exists and the caller
    /// must report "retry shortly". A marker older than the TTL is presumed
    /// abandoned, reclaimed with a warning, and the create retried once.
    pub fn acquire(&self, request_id: &str) -> Result<Option<InteractionLease>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create lease directory {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.lock", marker_file_name(request_id)));
        self.attempt_acquire(&path, request_id, true)
    }

    fn attempt_acquire(
        &self,
        path: &Path,
        request_id: &str,
        allow_stale_cleanup: bool,
    ) -> Result<Option<InteractionLease>> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_file) => Ok(Some(InteractionLease {
                path: path.to_path_buf(),
                released: false,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if !allow_stale_cleanup {
                    return Ok(None);
                }

                let Some(modified) = fs::metadata(path)
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                else {
                    // Marker vanished between the two calls; one more try
                    // without the cleanup path.
                    return self.attempt_acquire(path, request_id, false);
                };

                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO);
                if age > self.ttl {
                    // An abandoned marker means a holder died without
                    // releasing; worth surfacing, not just cleaning up.
                    warn!(
                        request_id,
                        age_secs = age.as_secs(),
                        "reclaiming stale interaction lease marker"
                    );
                    let _ = fs::remove_file(path);
                    return self.attempt_acquire(path, request_id, false);
                }

                Ok(None)
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to create lease marker {}", path.display())
            }),
        }
    }
}

/// Keep external request ids from escaping the lease directory.
fn marker_file_name(request_id: &str) -> String {
    request_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Releasable handle for an acquired lease. Dropping the handle releases
/// best-effort; explicit [`InteractionLease::release`] reports failures.
pub struct InteractionLease {
    path: PathBuf,
    released: bool,
}

impl InteractionLease {
    /// Deletes the marker. A marker that is already gone counts as released.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to release lease marker {}", self.path.display())
            }),
        }
    }
}

impl Drop for InteractionLease {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Item catalog loaded from its backing file on first use and cached for
/// the process lifetime. Refreshing requires a restart.
pub struct LazyCatalog {
    path: PathBuf,
    cell: OnceLock<ItemCatalog>,
}

impl LazyCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceLock::new(),
        }
    }

    /// Skips the file load entirely; used by tests and embedders that carry
    /// their own catalog.
    #[must_use]
    pub fn preloaded(catalog: ItemCatalog) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(catalog);
        Self {
            path: PathBuf::new(),
            cell,
        }
    }

    pub fn get(&self) -> &ItemCatalog {
        self.cell.get_or_init(|| load_catalog(&self.path))
    }
}

fn load_catalog(path: &Path) -> ItemCatalog {
    match fs::read_to_string(path) {
        Ok(body) => match serde_json::from_str::<Vec<String>>(&body) {
            Ok(names) => ItemCatalog::new(names),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "item catalog file is unparsable, matching disabled"
                );
                ItemCatalog::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ItemCatalog::default(),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "item catalog file is unreadable, matching disabled"
            );
            ItemCatalog::default()
        }
    }
}

/// Renders the matched-item bullet list shared by trade summaries.
#[must_use]
pub fn format_matched_items(matches: &[TradeItemMatch]) -> Vec<String> {
    if matches.is_empty() {
        return vec!["- No known item match, please double-check manually.".to_string()];
    }

    matches
        .iter()
        .map(|item| {
            if item.is_unknown() {
                match item.suggestions.as_deref() {
                    Some(suggestions) if !suggestions.is_empty() => format!(
                        "- {} (no confident match, maybe: {})",
                        item.input,
                        suggestions.join(", ")
                    ),
                    _ => format!("- {} (no confident match)", item.input),
                }
            } else {
                format!("- {} (from \"{}\")", item.matched, item.input)
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeReply {
    pub trade: TradeRecord,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingReply {
    pub rating: RatingRecord,
    pub trade: TradeRecord,
    pub trade_completed: bool,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscortReply {
    pub escort: EscortRecord,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestReply {
    pub quest: QuestRecord,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryReply {
    pub summary: RepSummary,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub scanned: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub ledger_entries: usize,
    pub lines: Vec<String>,
}

/// The coordination service: every lifecycle operation the front-end can
/// invoke, composed over the record collections and the reputation ledger.
///
/// Construct one instance per backing directory and pass it where needed;
/// there is no hidden shared state.
pub struct TradeHall {
    trades: RecordStore<TradeRecord>,
    escorts: RecordStore<EscortRecord>,
    quests: RecordStore<QuestRecord>,
    ratings: RatingStore,
    rep: RepStore,
    catalog: LazyCatalog,
}

impl TradeHall {
    #[must_use]
    pub fn open(data_dir: &Path) -> Self {
        Self {
            trades: RecordStore::new(data_dir.join("trades.json")),
            escorts: RecordStore::new(data_dir.join("escorts.json")),
            quests: RecordStore::new(data_dir.join("quests.json")),
            ratings: RatingStore::new(data_dir.join("ratings.json")),
            rep: RepStore::new(data_dir.join("rep.json")),
            catalog: LazyCatalog::new(data_dir.join("items.json")),
        }
    }

    /// Same layout as [`TradeHall::open`] but with a caller-supplied catalog.
    #[must_use]
    pub fn with_catalog(data_dir: &Path, catalog: ItemCatalog) -> Self {
        Self {
            catalog: LazyCatalog::preloaded(catalog),
            ..Self::open(data_dir)
        }
    }

    #[must_use]
    pub fn trades(&self) -> &RecordStore<TradeRecord> {
        &self.trades
    }

    #[must_use]
    pub fn escorts(&self) -> &RecordStore<EscortRecord> {
        &self.escorts
    }

    #[must_use]
    pub fn quests(&self) -> &RecordStore<QuestRecord> {
        &self.quests
    }

    #[must_use]
    pub fn ratings(&self) -> &RatingStore {
        &self.ratings
    }

    #[must_use]
    pub fn rep(&self) -> &RepStore {
        &self.rep
    }

    /// Opens a trade in the `open` state, resolving the free-text item list
    /// against the catalog.
    pub fn create_trade(
        &self,
        seller_id: &str,
        request: &CreateTradeRequest,
    ) -> Result<TradeReply, TradehallError> {
        request.validate()?;

        if let Some(interaction_id) = request.interaction_id.as_deref() {
            if self.trades.get_by_interaction_id(interaction_id).is_some() {
                return Err(TradehallError::Duplicate(
                    "a trade for this request already exists".to_string(),
                ));
            }
        }

        let matched_items = self.catalog.get().match_input(&request.item_input);
        let trade = TradeRecord {
            id: Ulid::new(),
            interaction_id: request.interaction_id.clone(),
            seller_id: seller_id.to_string(),
            buyer_id: request.buyer_id.clone(),
            created_at: now_utc(),
            channel_id: request.channel_id.clone(),
            thread_id: request.thread_id.clone(),
            item_input: request.item_input.clone(),
            matched_items,
            price: request.price.clone(),
            notes: request.notes.clone(),
            status: TradeStatus::Open,
            summary_message_id: request.summary_message_id.clone(),
        };

        self.trades.save(trade.clone()).map_err(storage_err)?;
        debug!(trade_id = %trade.id, seller_id, buyer_id = %trade.buyer_id, "trade opened");

        let mut lines = vec![format!(
            "Trade {} opened by {} for {}.",
            trade.id, trade.seller_id, trade.buyer_id
        )];
        lines.push("Items:".to_string());
        lines.extend(format_matched_items(&trade.matched_items));
        if let Some(price) = trade.price.as_deref() {
            lines.push(format!("Price: {price}"));
        }
        if let Some(notes) = trade.notes.as_deref() {
            lines.push(format!("Notes: {notes}"));
        }
        lines.push("Share the trade id with both parties for completion and rating.".to_string());

        Ok(TradeReply { trade, lines })
    }

    /// Replaces a trade's recorded items, re-running the matcher. Seller
    /// only; no status restriction.
    pub fn update_trade_items(
        &self,
        actor_id: &str,
        request: &UpdateTradeItemsRequest,
    ) -> Result<TradeReply, TradehallError> {
        request.validate()?;
        let trade = self.resolve_trade(&request.trade)?;

        if trade.seller_id != actor_id {
            return Err(TradehallError::Unauthorized(
                "only the recorded seller can update the items for this trade".to_string(),
            ));
        }

        let matched_items = self.catalog.get().match_input(&request.items_input);
        let updated = self
            .trades
            .update_record(trade.id, |record| {
                record.item_input = request.items_input.clone();
                record.matched_items = matched_items;
            })
            .map_err(storage_err)?
            .ok_or_else(trade_not_found)?;

        let mut lines = vec![format!("Items updated for trade {} by {actor_id}.", updated.id)];
        lines.push("New items:".to_string());
        lines.extend(format_matched_items(&updated.matched_items));
        if let Some(reason) = request.reason.as_deref() {
            lines.push(format!("Reason: {reason}"));
        }

        Ok(TradeReply {
            trade: updated,
            lines,
        })
    }

    /// Signals completion of the exchange: `open` becomes `awaiting_rating`.
    /// Either participant may signal; repeat signals change nothing.
    pub fn mark_trade_complete(
        &self,
        actor_id: &str,
        selector: &RecordSelector,
    ) -> Result<TradeReply, TradehallError> {
        let trade = self.resolve_trade(selector)?;

        if !trade.is_participant(actor_id) {
            return Err(TradehallError::Unauthorized(
                "only the seller or buyer can mark this trade complete".to_string(),
            ));
        }

        match trade.status {
            TradeStatus::Open => {}
            TradeStatus::AwaitingRating => {
                return Err(TradehallError::Duplicate(
                    "this trade is already awaiting ratings".to_string(),
                ));
            }
            TradeStatus::Completed | TradeStatus::Cancelled => {
                return Err(TradehallError::Duplicate(format!(
                    "this trade is already {}",
                    trade.status.as_str()
                )));
            }
        }

        let updated = self
            .trades
            .update_record(trade.id, |record| {
                record.status = TradeStatus::AwaitingRating;
            })
            .map_err(storage_err)?
            .ok_or_else(trade_not_found)?;
        debug!(trade_id = %updated.id, actor_id, "trade awaiting ratings");

        let lines = vec![
            format!("Trade {} marked as complete by {actor_id}.", updated.id),
            "Both participants can now rate each other.".to_string(),
        ];

        Ok(TradeReply {
            trade: updated,
            lines,
        })
    }

    /// Cancels a trade from either open state. Terminal.
    pub fn cancel_trade(
        &self,
        actor_id: &str,
        selector: &RecordSelector,
        reason: Option<&str>,
    ) -> Result<TradeReply, TradehallError> {
        let trade = self.resolve_trade(selector)?;

        if !trade.is_participant(actor_id) {
            return Err(TradehallError::Unauthorized(
                "only the seller or buyer can cancel this trade".to_string(),
            ));
        }

        if trade.status.is_terminal() {
            return Err(TradehallError::Duplicate(format!(
                "this trade is already {}",
                trade.status.as_str()
            )));
        }

        let updated = self
            .trades
            .update_record(trade.id, |record| {
                record.status = TradeStatus::Cancelled;
            })
            .map_err(storage_err)?
            .ok_or_else(trade_not_found)?;
        debug!(trade_id = %updated.id, actor_id, "trade cancelled");

        let mut lines = vec![format!("Trade {} cancelled by {actor_id}.", updated.id)];
        if let Some(reason) = reason {
            lines.push(format!("Reason: {reason}"));
        }

        Ok(TradeReply {
            trade: updated,
            lines,
        })
    }

    /// Records a review of one participant by the other and appends the
    /// matching ledger entry. The trade completes on the rating that covers
    /// the second role; completion status is recomputed from the rating
    /// collection, never cached.
    pub fn submit_rating(
        &self,
        reviewer_id: &str,
        request: &SubmitRatingRequest,
    ) -> Result<RatingReply, TradehallError> {
        let trade = self.resolve_trade(&request.trade)?;

        // A cancelled trade is terminal; a rating must not revive it.
        if trade.status == TradeStatus::Cancelled {
            return Err(TradehallError::Duplicate(
                "this trade is already cancelled".to_string(),
            ));
        }

        let Some(target_role) = resolve_target_role(&trade, reviewer_id, request.target_role)
        else {
            return Err(TradehallError::Unauthorized(
                "you need to be the seller or buyer on this trade to leave a review".to_string(),
            ));
        };

        if trade.reviewer_for(target_role) != reviewer_id {
            return Err(TradehallError::Unauthorized(
                "you can only review your counterparty".to_string(),
            ));
        }

        if self.ratings.has_rating(trade.id, target_role) {
            return Err(TradehallError::Duplicate(
                "a review for that participant is already on file".to_string(),
            ));
        }

        let target_user_id = trade.user_in_role(target_role).to_string();
        let rating = RatingRecord {
            id: Ulid::new(),
            trade_id: trade.id,
            target_role,
            target_user_id: target_user_id.clone(),
            reviewer_user_id: reviewer_id.to_string(),
            rating: request.sentiment.amount(),
            comments: request.comments.clone(),
            created_at: now_utc(),
        };

        self.ratings.add(rating.clone()).map_err(storage_err)?;
        self.rep
            .add(RepEntry {
                id: Ulid::new(),
                user_id: target_user_id.clone(),
                amount: request.sentiment.amount(),
                source: RepSource {
                    source_type: RepSourceType::TradeRating,
                    record_id: Some(trade.id.to_string()),
                },
                reason: match request.sentiment {
                    RatingSentiment::Positive => RATING_POSITIVE_REASON.to_string(),
                    RatingSentiment::Negative => RATING_NEGATIVE_REASON.to_string(),
                },
                created_at: rating.created_at,
                created_by: reviewer_id.to_string(),
            })
            .map_err(storage_err)?;

        let seller_rated = self.ratings.has_rating(trade.id, RatingTargetRole::Seller);
        let buyer_rated = self.ratings.has_rating(trade.id, RatingTargetRole::Buyer);
        let completed = seller_rated && buyer_rated;

        let updated = self
            .trades
            .update_record(trade.id, |record| {
                record.status = if completed {
                    TradeStatus::Completed
                } else {
                    TradeStatus::AwaitingRating
                };
            })
            .map_err(storage_err)?
            .ok_or_else(trade_not_found)?;
        debug!(
            trade_id = %updated.id,
            target_role = target_role.as_str(),
            completed,
            "trade rating recorded"
        );

        let mut lines = vec![
            format!(
                "{} review recorded for the {} {} by the {} {}.",
                match request.sentiment {
                    RatingSentiment::Positive => "Positive",
                    RatingSentiment::Negative => "Negative",
                },
                target_role.as_str(),
                target_user_id,
                target_role.other().as_str(),
                reviewer_id
            ),
            format!("Trade id: {}", updated.id),
        ];
        if let Some(comments) = request.comments.as_deref() {
            lines.push(format!("Comments: {comments}"));
        }
        if completed {
            lines.push("Both reviews are on file; the trade is complete.".to_string());
            lines.push("Lock and archive the trade thread.".to_string());
        }

        Ok(RatingReply {
            rating,
            trade: updated,
            trade_completed: completed,
            lines,
        })
    }

    /// Opens an escort mission in the `open` state.
    pub fn create_escort(
        &self,
        escort_id: &str,
        request: &CreateEscortRequest,
    ) -> Result<EscortReply, TradehallError> {
        request.validate()?;

        if let Some(interaction_id) = request.interaction_id.as_deref() {
            if self.escorts.get_by_interaction_id(interaction_id).is_some() {
                return Err(TradehallError::Duplicate(
                    "an escort mission for this request already exists".to_string(),
                ));
            }
        }

        let escort = EscortRecord {
            id: Ulid::new(),
            interaction_id: request.interaction_id.clone(),
            escort_id: escort_id.to_string(),
            client_id: request.client_id.clone(),
            created_at: now_utc(),
            channel_id: request.channel_id.clone(),
            thread_id: request.thread_id.clone(),
            route: request.route.clone(),
            payment: request.payment.clone(),
            notes: request.notes.clone(),
            status: EscortStatus::Open,
        };

        self.escorts.save(escort.clone()).map_err(storage_err)?;
        debug!(escort_id = %escort.id, "escort mission opened");

        let mut lines = vec![format!(
            "Escort mission {} opened: {} escorting {}.",
            escort.id, escort.escort_id, escort.client_id
        )];
        lines.push(format!("Route: {}", escort.route));
        if let Some(payment) = escort.payment.as_deref() {
            lines.push(format!("Payment: {payment}"));
        }
        if let Some(notes) = escort.notes.as_deref() {
            lines.push(format!("Notes: {notes}"));
        }

        Ok(EscortReply { escort, lines })
    }

    /// Completes an escort mission and rewards both parties with one
    /// reputation point each. A second completion attempt is refused and
    /// never re-issues the rewards.
    pub fn complete_escort(
        &self,
        actor_id: &str,
        selector: &RecordSelector,
    ) -> Result<EscortReply, TradehallError> {
        let escort = self.resolve_escort(selector)?;

        if !escort.is_participant(actor_id) {
            return Err(TradehallError::Unauthorized(
                "only the escort or the client can complete this mission".to_string(),
            ));
        }

        if escort.status == EscortStatus::Completed {
            return Err(TradehallError::Duplicate(
                "this escort mission is already completed".to_string(),
            ));
        }

        let updated = self
            .escorts
            .update_record(escort.id, |record| {
                record.status = EscortStatus::Completed;
            })
            .map_err(storage_err)?
            .ok_or_else(escort_not_found)?;

        let completed_at = now_utc();
        for user_id in [updated.escort_id.as_str(), updated.client_id.as_str()] {
            self.rep
                .add(RepEntry {
                    id: Ulid::new(),
                    user_id: user_id.to_string(),
                    amount: 1,
                    source: RepSource {
                        source_type: RepSourceType::Escort,
                        record_id: Some(updated.id.to_string()),
                    },
                    reason: ESCORT_REWARD_REASON.to_string(),
                    created_at: completed_at,
                    created_by: actor_id.to_string(),
                })
                .map_err(storage_err)?;
        }
        debug!(escort_id = %updated.id, actor_id, "escort mission completed");

        let lines = vec![
            format!("Escort mission {} completed.", updated.id),
            format!(
                "+1 reputation to {} and {}.",
                updated.escort_id, updated.client_id
            ),
        ];

        Ok(EscortReply {
            escort: updated,
            lines,
        })
    }

    /// Opens a quest. Creation and metadata only; downstream transitions
    /// are an extension point, not wired to any operation.
    pub fn create_quest(
        &self,
        creator_id: &str,
        request: &CreateQuestRequest,
    ) -> Result<QuestReply, TradehallError> {
        request.validate()?;

        if let Some(interaction_id) = request.interaction_id.as_deref() {
            if self.quests.get_by_interaction_id(interaction_id).is_some() {
                return Err(TradehallError::Duplicate(
                    "a quest for this request already exists".to_string(),
                ));
            }
        }

        let quest = QuestRecord {
            id: Ulid::new(),
            interaction_id: request.interaction_id.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            reward_rep: request.reward_rep,
            reward_items: request.reward_items.clone(),
            deadline: request.deadline,
            creator_id: creator_id.to_string(),
            assignee_id: request.assignee_id.clone(),
            created_at: now_utc(),
            channel_id: request.channel_id.clone(),
            thread_id: request.thread_id.clone(),
            status: QuestStatus::Open,
            completed_at: None,
            completed_by_id: None,
            reward_recipient_id: None,
        };

        self.quests.save(quest.clone()).map_err(storage_err)?;
        debug!(quest_id = %quest.id, creator_id, "quest opened");

        let mut lines = vec![format!("Quest {} opened: {}", quest.id, quest.title)];
        lines.push(format!("Reward: {} reputation", quest.reward_rep));
        if let Some(items) = quest.reward_items.as_deref() {
            lines.push(format!("Reward items: {items}"));
        }
        if let Some(deadline) = quest.deadline {
            let formatted = format_rfc3339(deadline)
                .unwrap_or_else(|_| "invalid deadline".to_string());
            lines.push(format!("Deadline: {formatted}"));
        }
        if let Some(assignee) = quest.assignee_id.as_deref() {
            lines.push(format!("Assigned to: {assignee}"));
        }

        Ok(QuestReply { quest, lines })
    }

    /// Current reputation standing for a user, recomputed from the ledger.
    #[must_use]
    pub fn reputation_summary(&self, user_id: &str) -> SummaryReply {
        let summary = self.rep.summary_for_user(user_id);
        let mut lines = vec![
            format!("Reputation for {user_id}"),
            format!("Score: {}", summary.total),
            format!("Positive reviews: {}", summary.positive_ratings),
            format!("Negative reviews: {}", summary.negative_ratings),
            format!("Ledger entries: {}", summary.entries),
        ];
        for (source_type, amount) in &summary.breakdown {
            lines.push(format!("  {}: {amount}", source_type.as_str()));
        }

        SummaryReply { summary, lines }
    }

    /// One-shot, re-runnable backfill of the ledger from the retired
    /// per-trade rating file. Entries already present (keyed by trade,
    /// reviewed user, and amount) are skipped, so repeat runs are no-ops.
    pub fn migrate_legacy_ratings(
        &self,
        legacy_path: &Path,
    ) -> Result<MigrationReport, TradehallError> {
        let legacy_store: JsonStore<Vec<LegacyRating>> = JsonStore::new(legacy_path);
        let legacy = legacy_store.read();
        let ledger = self.rep.list();

        let planned = plan_rating_migration(&legacy, &ledger)?;
        let migrated = planned.len();
        if migrated > 0 {
            self.rep.add_all(planned).map_err(storage_err)?;
        }

        let ledger_entries = ledger.len() + migrated;
        let scanned = legacy.len();
        let skipped = scanned - migrated;
        let lines = vec![
            format!("Scanned {scanned} legacy rating(s)."),
            format!("Migrated {migrated}, skipped {skipped} already present."),
            format!("Ledger now holds {ledger_entries} entries."),
        ];

        Ok(MigrationReport {
            scanned,
            migrated,
            skipped,
            ledger_entries,
            lines,
        })
    }

    fn resolve_trade(&self, selector: &RecordSelector) -> Result<TradeRecord, TradehallError> {
        selector.validate()?;

        if let Some(record_id) = selector.record_id {
            if let Some(trade) = self.trades.get_by_id(record_id) {
                return Ok(trade);
            }
        }
        if let Some(thread_id) = selector.thread_id.as_deref() {
            if let Some(trade) = self.trades.get_by_thread_id(thread_id) {
                return Ok(trade);
            }
        }

        Err(trade_not_found())
    }

    fn resolve_escort(&self, selector: &RecordSelector) -> Result<EscortRecord, TradehallError> {
        selector.validate()?;

        if let Some(record_id) = selector.record_id {
            if let Some(escort) = self.escorts.get_by_id(record_id) {
                return Ok(escort);
            }
        }
        if let Some(thread_id) = selector.thread_id.as_deref() {
            if let Some(escort) = self.escorts.get_by_thread_id(thread_id) {
                return Ok(escort);
            }
        }

        Err(escort_not_found())
    }
}

fn trade_not_found() -> TradehallError {
    TradehallError::NotFound(
        "trade not found; provide a valid trade id or run the command inside its thread"
            .to_string(),
    )
}

fn escort_not_found() -> TradehallError {
    TradehallError::NotFound(
        "escort mission not found; provide a valid id or run the command inside its thread"
            .to_string(),
    )
}

fn storage_err(err: anyhow::Error) -> TradehallError {
    let detail = format!("{err:#}");
    error!(error = %detail, "storage operation failed");
    TradehallError::Storage(detail)
}
