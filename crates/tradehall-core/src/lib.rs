use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;
use unicode_normalization::UnicodeNormalization;

/// Failure taxonomy shared by every lifecycle operation.
///
/// Each variant maps to exactly one user-facing message per attempted
/// operation; none of them leaves a partially applied transition behind.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TradehallError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("another delivery of this request is still being handled, retry shortly")]
    LeaseContention,
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    AwaitingRating,
    Completed,
    Cancelled,
}

impl TradeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::AwaitingRating => "awaiting_rating",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "awaiting_rating" => Some(Self::AwaitingRating),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further lifecycle transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscortStatus {
    Open,
    Completed,
}

impl EscortStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Quest states beyond `Open` are declared for forward compatibility of the
/// stored records; no operation currently drives them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl QuestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// The side of a trade being reviewed, not the side leaving the review.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RatingTargetRole {
    Seller,
    Buyer,
}

impl RatingTargetRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seller => "seller",
            Self::Buyer => "buyer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "seller" => Some(Self::Seller),
            "buyer" => Some(Self::Buyer),
            _ => None,
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Seller => Self::Buyer,
            Self::Buyer => Self::Seller,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RatingSentiment {
    Positive,
    Negative,
}

impl RatingSentiment {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }

    /// Signed point value contributed to the reputation ledger.
    #[must_use]
    pub fn amount(self) -> i64 {
        match self {
            Self::Positive => 1,
            Self::Negative => -1,
        }
    }

    #[must_use]
    pub fn from_amount(amount: i64) -> Option<Self> {
        match amount {
            1 => Some(Self::Positive),
            -1 => Some(Self::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepSourceType {
    TradeRating,
    Escort,
    Quest,
    Event,
    Manual,
}

impl RepSourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TradeRating => "trade_rating",
            Self::Escort => "escort",
            Self::Quest => "quest",
            Self::Event => "event",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trade_rating" => Some(Self::TradeRating),
            "escort" => Some(Self::Escort),
            "quest" => Some(Self::Quest),
            "event" => Some(Self::Event),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One resolved chunk of free-text item input. Embedded in [`TradeRecord`],
/// never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeItemMatch {
    pub input: String,
    #[serde(rename = "match")]
    pub matched: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}

impl TradeItemMatch {
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.matched == UNKNOWN_ITEM
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub id: Ulid,
    pub interaction_id: Option<String>,
    pub seller_id: String,
    pub buyer_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub channel_id: String,
    pub thread_id: String,
    pub item_input: String,
    pub matched_items: Vec<TradeItemMatch>,
    pub price: Option<String>,
    pub notes: Option<String>,
    pub status: TradeStatus,
    pub summary_message_id: Option<String>,
}

impl TradeRecord {
    #[must_use]
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.seller_id == user_id || self.buyer_id == user_id
    }

    /// User occupying the given role on this trade.
    #[must_use]
    pub fn user_in_role(&self, role: RatingTargetRole) -> &str {
        match role {
            RatingTargetRole::Seller => &self.seller_id,
            RatingTargetRole::Buyer => &self.buyer_id,
        }
    }

    /// Counterparty expected to review the given role.
    #[must_use]
    pub fn reviewer_for(&self, role: RatingTargetRole) -> &str {
        self.user_in_role(role.other())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscortRecord {
    pub id: Ulid,
    pub interaction_id: Option<String>,
    pub escort_id: String,
    pub client_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub channel_id: String,
    pub thread_id: String,
    pub route: String,
    pub payment: Option<String>,
    pub notes: Option<String>,
    pub status: EscortStatus,
}

impl EscortRecord {
    #[must_use]
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.escort_id == user_id || self.client_id == user_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestRecord {
    pub id: Ulid,
    pub interaction_id: Option<String>,
    pub title: String,
    pub description: String,
    pub reward_rep: i64,
    pub reward_items: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    pub creator_id: String,
    pub assignee_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub channel_id: String,
    pub thread_id: String,
    pub status: QuestStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub completed_by_id: Option<String>,
    pub reward_recipient_id: Option<String>,
}

/// A signed review of one trade participant by the other. At most one per
/// `(trade_id, target_role)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingRecord {
    pub id: Ulid,
    pub trade_id: Ulid,
    pub target_role: RatingTargetRole,
    pub target_user_id: String,
    pub reviewer_user_id: String,
    pub rating: i64,
    pub comments: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepSource {
    #[serde(rename = "type")]
    pub source_type: RepSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// One immutable ledger contribution. Entries are appended and never
/// mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepEntry {
    pub id: Ulid,
    pub user_id: String,
    pub amount: i64,
    pub source: RepSource,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepSummary {
    pub user_id: String,
    pub total: i64,
    pub positive_ratings: u64,
    pub negative_ratings: u64,
    pub entries: u64,
    pub breakdown: BTreeMap<RepSourceType, i64>,
}

/// Aggregates a user's ledger entries into a reputation summary.
///
/// Entries belonging to other users are ignored, so callers may pass either
/// a pre-filtered slice or the whole ledger.
#[must_use]
pub fn summarize_rep(user_id: &str, entries: &[RepEntry]) -> RepSummary {
    let mut total = 0_i64;
    let mut positive_ratings = 0_u64;
    let mut negative_ratings = 0_u64;
    let mut count = 0_u64;
    let mut breakdown: BTreeMap<RepSourceType, i64> = BTreeMap::new();

    for entry in entries.iter().filter(|entry| entry.user_id == user_id) {
        total += entry.amount;
        count += 1;
        *breakdown.entry(entry.source.source_type).or_insert(0) += entry.amount;
        if entry.source.source_type == RepSourceType::TradeRating {
            if entry.amount > 0 {
                positive_ratings += 1;
            }
            if entry.amount < 0 {
                negative_ratings += 1;
            }
        }
    }

    RepSummary {
        user_id: user_id.to_string(),
        total,
        positive_ratings,
        negative_ratings,
        entries: count,
        breakdown,
    }
}

/// Rating record shape written by the retired single-file rating system,
/// consumed only by the ledger migration. Field names keep that system's
/// camelCase layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRating {
    pub id: String,
    pub trade_id: String,
    #[serde(default)]
    pub target_role: Option<RatingTargetRole>,
    pub target_user_id: String,
    pub reviewer_user_id: String,
    pub rating: i64,
    #[serde(default)]
    pub comments: Option<String>,
    pub created_at: String,
}

const MIGRATED_POSITIVE_REASON: &str = "Positive trade review (migration)";
const MIGRATED_NEGATIVE_REASON: &str = "Negative trade review (migration)";

/// Plans the legacy-rating backfill without touching storage.
///
/// A legacy rating is skipped when the ledger already holds a `trade_rating`
/// entry with the same `(trade_id, target_user_id, amount)` key, so applying
/// the returned entries and planning again yields an empty plan.
///
/// # Errors
/// Returns [`TradehallError::Validation`] when a legacy rating carries a
/// value other than +1/-1 or an unparsable timestamp.
pub fn plan_rating_migration(
    legacy: &[LegacyRating],
    ledger: &[RepEntry],
) -> Result<Vec<RepEntry>, TradehallError> {
    let mut seen: BTreeSet<(String, String, i64)> = ledger
        .iter()
        .filter(|entry| entry.source.source_type == RepSourceType::TradeRating)
        .filter_map(|entry| {
            entry
                .source
                .record_id
                .as_ref()
                .map(|record_id| (record_id.clone(), entry.user_id.clone(), entry.amount))
        })
        .collect();

    let mut planned = Vec::new();
    for rating in legacy {
        let Some(sentiment) = RatingSentiment::from_amount(rating.rating) else {
            return Err(TradehallError::Validation(format!(
                "legacy rating for trade {} has unsupported value {}",
                rating.trade_id, rating.rating
            )));
        };

        let key = (
            rating.trade_id.clone(),
            rating.target_user_id.clone(),
            rating.rating,
        );
        if !seen.insert(key) {
            continue;
        }

        let created_at = parse_rfc3339_utc(&rating.created_at).map_err(|err| {
            TradehallError::Validation(format!(
                "legacy rating {} has invalid timestamp: {err}",
                rating.id
            ))
        })?;

        planned.push(RepEntry {
            id: Ulid::new(),
            user_id: rating.target_user_id.clone(),
            amount: rating.rating,
            source: RepSource {
                source_type: RepSourceType::TradeRating,
                record_id: Some(rating.trade_id.clone()),
            },
            reason: match sentiment {
                RatingSentiment::Positive => MIGRATED_POSITIVE_REASON.to_string(),
                RatingSentiment::Negative => MIGRATED_NEGATIVE_REASON.to_string(),
            },
            created_at,
            created_by: rating.reviewer_user_id.clone(),
        });
    }

    Ok(planned)
}

/// Picks the role a reviewer is allowed to rate on a trade.
///
/// Non-participants get `None`. An explicit preference wins; otherwise the
/// buyer reviews the seller and the seller reviews the buyer.
#[must_use]
pub fn resolve_target_role(
    trade: &TradeRecord,
    reviewer_id: &str,
    requested: Option<RatingTargetRole>,
) -> Option<RatingTargetRole> {
    if !trade.is_participant(reviewer_id) {
        return None;
    }

    if let Some(role) = requested {
        return Some(role);
    }

    if trade.buyer_id == reviewer_id {
        Some(RatingTargetRole::Seller)
    } else {
        Some(RatingTargetRole::Buyer)
    }
}

/// Identifies a trade or escort either by record id or by the thread the
/// request arrived in. An explicit id wins over the thread fallback.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RecordSelector {
    pub record_id: Option<Ulid>,
    pub thread_id: Option<String>,
}

impl RecordSelector {
    #[must_use]
    pub fn by_id(record_id: Ulid) -> Self {
        Self {
            record_id: Some(record_id),
            thread_id: None,
        }
    }

    #[must_use]
    pub fn by_thread(thread_id: impl Into<String>) -> Self {
        Self {
            record_id: None,
            thread_id: Some(thread_id.into()),
        }
    }

    /// # Errors
    /// Returns [`TradehallError::Validation`] when neither an id nor a
    /// thread reference is present.
    pub fn validate(&self) -> Result<(), TradehallError> {
        if self.record_id.is_none() && self.thread_id.is_none() {
            return Err(TradehallError::Validation(
                "provide a record id or run the command inside the record's thread".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTradeRequest {
    pub interaction_id: Option<String>,
    pub buyer_id: String,
    pub item_input: String,
    pub price: Option<String>,
    pub notes: Option<String>,
    pub channel_id: String,
    pub thread_id: String,
    /// Reference to an already-posted summary message, when the front-end
    /// renders one before persisting the record.
    pub summary_message_id: Option<String>,
}

impl CreateTradeRequest {
    /// # Errors
    /// Returns [`TradehallError::Validation`] when required fields are
    /// missing or blank.
    pub fn validate(&self) -> Result<(), TradehallError> {
        if self.buyer_id.trim().is_empty() {
            return Err(TradehallError::Validation(
                "buyer is required for a trade".to_string(),
            ));
        }
        if self.item_input.trim().is_empty() {
            return Err(TradehallError::Validation(
                "item text is required for a trade".to_string(),
            ));
        }
        require_channel_refs(&self.channel_id, &self.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTradeItemsRequest {
    pub trade: RecordSelector,
    pub items_input: String,
    pub reason: Option<String>,
}

impl UpdateTradeItemsRequest {
    /// # Errors
    /// Returns [`TradehallError::Validation`] on a blank replacement list or
    /// an empty selector.
    pub fn validate(&self) -> Result<(), TradehallError> {
        self.trade.validate()?;
        if self.items_input.trim().is_empty() {
            return Err(TradehallError::Validation(
                "replacement item text must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRatingRequest {
    pub trade: RecordSelector,
    pub target_role: Option<RatingTargetRole>,
    pub sentiment: RatingSentiment,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateEscortRequest {
    pub interaction_id: Option<String>,
    pub client_id: String,
    pub route: String,
    pub payment: Option<String>,
    pub notes: Option<String>,
    pub channel_id: String,
    pub thread_id: String,
}

impl CreateEscortRequest {
    /// # Errors
    /// Returns [`TradehallError::Validation`] when required fields are
    /// missing or blank.
    pub fn validate(&self) -> Result<(), TradehallError> {
        if self.client_id.trim().is_empty() {
            return Err(TradehallError::Validation(
                "client is required for an escort mission".to_string(),
            ));
        }
        if self.route.trim().is_empty() {
            return Err(TradehallError::Validation(
                "route or objective text is required for an escort mission".to_string(),
            ));
        }
        require_channel_refs(&self.channel_id, &self.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateQuestRequest {
    pub interaction_id: Option<String>,
    pub title: String,
    pub description: String,
    pub reward_rep: i64,
    pub reward_items: Option<String>,
    pub deadline: Option<OffsetDateTime>,
    pub assignee_id: Option<String>,
    pub channel_id: String,
    pub thread_id: String,
}

impl CreateQuestRequest {
    /// # Errors
    /// Returns [`TradehallError::Validation`] when the title or description
    /// is blank, the reward is below one point, or the deadline is not UTC.
    pub fn validate(&self) -> Result<(), TradehallError> {
        if self.title.trim().is_empty() {
            return Err(TradehallError::Validation(
                "quest title must not be empty".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(TradehallError::Validation(
                "quest description must not be empty".to_string(),
            ));
        }
        if self.reward_rep < 1 {
            return Err(TradehallError::Validation(
                "quest reward must be at least 1 reputation point".to_string(),
            ));
        }
        if let Some(deadline) = self.deadline {
            if deadline.offset() != UtcOffset::UTC {
                return Err(TradehallError::Validation(
                    "quest deadline must be UTC".to_string(),
                ));
            }
        }
        require_channel_refs(&self.channel_id, &self.thread_id)
    }
}

fn require_channel_refs(channel_id: &str, thread_id: &str) -> Result<(), TradehallError> {
    if channel_id.trim().is_empty() {
        return Err(TradehallError::Validation(
            "channel reference must be provided".to_string(),
        ));
    }
    if thread_id.trim().is_empty() {
        return Err(TradehallError::Validation(
            "thread reference must be provided".to_string(),
        ));
    }
    Ok(())
}

/// Placeholder name reported when no catalog entry is a trustworthy match.
pub const UNKNOWN_ITEM: &str = "unknown";

/// Candidates farther than this normalized distance are never offered.
const FUZZY_DISTANCE_THRESHOLD: f64 = 0.35;
/// A lone candidate is trusted outright above this confidence.
const CONFIDENT_MATCH_CONFIDENCE: f64 = 0.7;
/// Fraction of input tokens that must reappear in the candidate.
const CONFIDENT_TOKEN_OVERLAP: f64 = 0.5;
const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone)]
struct CatalogEntry {
    original: String,
    normalized: String,
    tokens: Vec<String>,
}

/// Reference list of canonical item names and the fuzzy matcher over it.
///
/// Matching is deterministic: identical input against an unchanged catalog
/// always yields identical results, ties ranked by catalog order.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    entries: Vec<CatalogEntry>,
}

impl ItemCatalog {
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        let entries = names
            .into_iter()
            .map(|original| {
                let normalized = normalize_item_text(&original);
                let tokens = tokenize(&normalized);
                CatalogEntry {
                    original,
                    normalized,
                    tokens,
                }
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves free text against the catalog, one result per chunk in input
    /// order. Chunks are split on commas, semicolons, and newlines.
    ///
    /// An empty catalog produces no results at all; callers treat that as
    /// "unmatched, verify manually".
    #[must_use]
    pub fn match_input(&self, raw_input: &str) -> Vec<TradeItemMatch> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for input in split_input(raw_input) {
            let normalized = normalize_item_text(input);
            let tokens = tokenize(&normalized);

            if tokens.is_empty() {
                matches.push(unknown_match(input, None));
                continue;
            }

            if let Some(direct) = self
                .entries
                .iter()
                .find(|entry| entry.normalized == normalized)
            {
                matches.push(TradeItemMatch {
                    input: input.to_string(),
                    matched: direct.original.clone(),
                    score: 0.0,
                    suggestions: None,
                });
                continue;
            }

            let ranked = self.ranked_candidates(&normalized);
            if let Some(&(best_index, distance)) = ranked.first() {
                let best = &self.entries[best_index];
                let confidence = 1.0 - distance;
                let overlap = token_overlap(&tokens, &best.tokens);
                if confidence >= CONFIDENT_MATCH_CONFIDENCE
                    || overlap >= CONFIDENT_TOKEN_OVERLAP
                    || tokens.len() == 1
                {
                    matches.push(TradeItemMatch {
                        input: input.to_string(),
                        matched: best.original.clone(),
                        score: distance,
                        suggestions: None,
                    });
                    continue;
                }
            }

            let suggestions: Vec<String> = ranked
                .iter()
                .map(|&(index, _)| self.entries[index].original.clone())
                .collect();
            matches.push(unknown_match(
                input,
                if suggestions.is_empty() {
                    None
                } else {
                    Some(suggestions)
                },
            ));
        }

        matches
    }

    /// Candidates within the distance threshold, closest first, capped at
    /// the suggestion limit. The sort is stable so equal distances keep
    /// catalog order.
    fn ranked_candidates(&self, normalized_input: &str) -> Vec<(usize, f64)> {
        let needle: Vec<char> = normalized_input.chars().collect();
        let mut scored: Vec<(usize, f64)> = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let haystack: Vec<char> = entry.normalized.chars().collect();
            let distance = normalized_distance(&needle, &haystack);
            if distance <= FUZZY_DISTANCE_THRESHOLD {
                scored.push((index, distance));
            }
        }
        scored.sort_by(|lhs, rhs| {
            lhs.1
                .partial_cmp(&rhs.1)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(MAX_SUGGESTIONS);
        scored
    }
}

fn unknown_match(input: &str, suggestions: Option<Vec<String>>) -> TradeItemMatch {
    TradeItemMatch {
        input: input.to_string(),
        matched: UNKNOWN_ITEM.to_string(),
        score: 1.0,
        suggestions,
    }
}

/// Lowercases, strips diacritics via NFD decomposition, replaces anything
/// that is not a letter or digit with whitespace, and collapses runs.
#[must_use]
pub fn normalize_item_text(value: &str) -> String {
    let lowered = value.to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());
    for ch in lowered.nfd() {
        if ch.is_alphanumeric() {
            cleaned.push(ch);
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokenize(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[allow(clippy::cast_precision_loss)]
fn token_overlap(input_tokens: &[String], candidate_tokens: &[String]) -> f64 {
    if input_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }
    let candidate: BTreeSet<&str> = candidate_tokens.iter().map(String::as_str).collect();
    let hits = input_tokens
        .iter()
        .filter(|token| candidate.contains(token.as_str()))
        .count();
    hits as f64 / input_tokens.len() as f64
}

fn split_input(raw: &str) -> Vec<&str> {
    raw.split(|ch| ch == ',' || ch == ';' || ch == '\n')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// Edit distance from `needle` to the closest contiguous window of
/// `haystack`: skipping haystack characters before or after the window is
/// free, edits inside it cost one each.
fn substring_edit_distance(needle: &[char], haystack: &[char]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    if haystack.is_empty() {
        return needle.len();
    }

    // First row is zero: the window may start anywhere in the haystack.
    let mut prev: Vec<usize> = vec![0; haystack.len() + 1];
    let mut curr: Vec<usize> = vec![0; haystack.len() + 1];

    for (row, needle_ch) in needle.iter().enumerate() {
        curr[0] = row + 1;
        for (col, haystack_ch) in haystack.iter().enumerate() {
            let substitution = prev[col] + usize::from(needle_ch != haystack_ch);
            let skip_haystack = curr[col] + 1;
            let skip_needle = prev[col + 1] + 1;
            curr[col + 1] = substitution.min(skip_haystack).min(skip_needle);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    // The window may also end anywhere, hence the minimum over the last row.
    match prev.iter().copied().min() {
        Some(edits) => edits,
        None => needle.len(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn normalized_distance(needle: &[char], haystack: &[char]) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    let edits = substring_edit_distance(needle, haystack);
    edits as f64 / needle.len() as f64
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`TradehallError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TradehallError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TradehallError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TradehallError::Validation(
            "timestamp must use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TradehallError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TradehallError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            TradehallError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn catalog(names: &[&str]) -> ItemCatalog {
        ItemCatalog::new(names.iter().map(|name| (*name).to_string()).collect())
    }

    fn fixture_trade() -> TradeRecord {
        TradeRecord {
            id: Ulid::new(),
            interaction_id: None,
            seller_id: "seller-1".to_string(),
            buyer_id: "buyer-1".to_string(),
            created_at: must_utc("2026-03-01T12:00:00Z"),
            channel_id: "chan-1".to_string(),
            thread_id: "thread-1".to_string(),
            item_input: "arc alloy".to_string(),
            matched_items: Vec::new(),
            price: None,
            notes: None,
            status: TradeStatus::Open,
            summary_message_id: None,
        }
    }

    fn rep_entry(user_id: &str, amount: i64, source_type: RepSourceType) -> RepEntry {
        RepEntry {
            id: Ulid::new(),
            user_id: user_id.to_string(),
            amount,
            source: RepSource {
                source_type,
                record_id: None,
            },
            reason: "fixture".to_string(),
            created_at: must_utc("2026-03-01T12:00:00Z"),
            created_by: "tester".to_string(),
        }
    }

    fn legacy_rating(trade_id: &str, target: &str, rating: i64) -> LegacyRating {
        LegacyRating {
            id: format!("legacy-{trade_id}-{target}"),
            trade_id: trade_id.to_string(),
            target_role: Some(RatingTargetRole::Seller),
            target_user_id: target.to_string(),
            reviewer_user_id: "reviewer-1".to_string(),
            rating,
            comments: None,
            created_at: "2025-11-02T08:30:00.000Z".to_string(),
        }
    }

    #[test]
    fn exact_catalog_entry_matches_with_score_zero() {
        let catalog = catalog(&["ARC Alloy", "ARC Powercell", "Mechanical Components"]);
        let matches = catalog.match_input("Mechanical Components");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, "Mechanical Components");
        assert_eq!(matches[0].score, 0.0);
    }

    #[test]
    fn close_misspelling_matches_within_threshold() {
        let catalog = catalog(&["ARC Alloy", "ARC Powercell", "Mechanical Components"]);
        let matches = catalog.match_input("arc powrcell");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, "ARC Powercell");
        assert!(matches[0].score > 0.0);
        assert!(matches[0].score < 0.35);
    }

    #[test]
    fn comma_separated_inputs_match_in_order() {
        let catalog = catalog(&["ARC Alloy", "Mechanical Components"]);
        let matches = catalog.match_input("alloy, mechanical components");

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].matched, "ARC Alloy");
        assert_eq!(matches[1].matched, "Mechanical Components");
    }

    #[test]
    fn matching_is_deterministic() {
        let catalog = catalog(&["ARC Alloy", "ARC Powercell", "Mechanical Components"]);
        let first = catalog.match_input("arc powrcell, aloy; mech components");
        let second = catalog.match_input("arc powrcell, aloy; mech components");
        assert_eq!(first, second);
    }

    #[test]
    fn unmatchable_input_reports_unknown_without_suggestions() {
        let catalog = catalog(&["ARC Alloy", "Mechanical Components"]);
        let matches = catalog.match_input("quantum flux capacitor rings");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, UNKNOWN_ITEM);
        assert_eq!(matches[0].score, 1.0);
        assert!(matches[0].suggestions.is_none());
    }

    #[test]
    fn near_miss_below_confidence_reports_suggestions() {
        // "fuze wyre" sits at distance 3/9 from "fusewire": inside the
        // exclusion threshold but below the confidence bar, with no token
        // overlap and more than one token.
        let catalog = catalog(&["Fusewire"]);
        let matches = catalog.match_input("fuze wyre");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, UNKNOWN_ITEM);
        assert_eq!(matches[0].score, 1.0);
        assert_eq!(
            must_some(matches[0].suggestions.clone()),
            vec!["Fusewire".to_string()]
        );
    }

    #[test]
    fn empty_catalog_produces_no_matches() {
        let catalog = ItemCatalog::default();
        assert!(catalog.is_empty());
        assert!(catalog.match_input("arc alloy, fusewire").is_empty());
    }

    #[test]
    fn punctuation_only_chunk_reports_unknown() {
        let catalog = catalog(&["ARC Alloy"]);
        let matches = catalog.match_input("!!!");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, UNKNOWN_ITEM);
        assert!(matches[0].suggestions.is_none());
    }

    #[test]
    fn normalization_strips_diacritics_and_symbols() {
        assert_eq!(normalize_item_text("Émeraude Coré"), "emeraude core");
        assert_eq!(normalize_item_text("  ARC-Alloy  (Mk.II) "), "arc alloy mk ii");
    }

    #[test]
    fn single_token_input_accepts_nearest_candidate() {
        let catalog = catalog(&["ARC Alloy"]);
        let matches = catalog.match_input("aloy");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, "ARC Alloy");
    }

    #[test]
    fn summary_totals_and_breakdown_follow_the_ledger() {
        let entries = vec![
            rep_entry("user-1", 1, RepSourceType::TradeRating),
            rep_entry("user-1", -1, RepSourceType::TradeRating),
            rep_entry("user-1", 1, RepSourceType::Escort),
            rep_entry("user-2", 1, RepSourceType::TradeRating),
        ];

        let summary = summarize_rep("user-1", &entries);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.positive_ratings, 1);
        assert_eq!(summary.negative_ratings, 1);
        assert_eq!(summary.breakdown.get(&RepSourceType::TradeRating), Some(&0));
        assert_eq!(summary.breakdown.get(&RepSourceType::Escort), Some(&1));
    }

    #[test]
    fn summary_for_unknown_user_is_empty() {
        let summary = summarize_rep("nobody", &[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.entries, 0);
        assert!(summary.breakdown.is_empty());
    }

    #[test]
    fn migration_plan_skips_already_migrated_keys() {
        let legacy = vec![
            legacy_rating("trade-1", "user-1", 1),
            legacy_rating("trade-2", "user-2", -1),
        ];
        let first = must_ok(plan_rating_migration(&legacy, &[]));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].reason, MIGRATED_POSITIVE_REASON);
        assert_eq!(first[1].reason, MIGRATED_NEGATIVE_REASON);

        let second = must_ok(plan_rating_migration(&legacy, &first));
        assert!(second.is_empty());
    }

    #[test]
    fn migration_plan_dedupes_within_the_legacy_batch() {
        let legacy = vec![
            legacy_rating("trade-1", "user-1", 1),
            legacy_rating("trade-1", "user-1", 1),
        ];
        let planned = must_ok(plan_rating_migration(&legacy, &[]));
        assert_eq!(planned.len(), 1);
    }

    #[test]
    fn migration_rejects_out_of_range_rating_values() {
        let mut bad = legacy_rating("trade-1", "user-1", 1);
        bad.rating = 2;
        let result = plan_rating_migration(&[bad], &[]);
        assert!(matches!(result, Err(TradehallError::Validation(_))));
    }

    #[test]
    fn migration_carries_reviewer_and_timestamp_through() {
        let legacy = vec![legacy_rating("trade-9", "user-9", -1)];
        let planned = must_ok(plan_rating_migration(&legacy, &[]));

        assert_eq!(planned[0].created_by, "reviewer-1");
        assert_eq!(planned[0].user_id, "user-9");
        assert_eq!(
            planned[0].source.record_id.as_deref(),
            Some("trade-9")
        );
        assert_eq!(planned[0].created_at, must_utc("2025-11-02T08:30:00Z"));
    }

    #[test]
    fn target_role_defaults_to_the_counterparty() {
        let trade = fixture_trade();
        assert_eq!(
            resolve_target_role(&trade, "buyer-1", None),
            Some(RatingTargetRole::Seller)
        );
        assert_eq!(
            resolve_target_role(&trade, "seller-1", None),
            Some(RatingTargetRole::Buyer)
        );
        assert_eq!(resolve_target_role(&trade, "stranger", None), None);
    }

    #[test]
    fn explicit_target_role_overrides_the_default() {
        let trade = fixture_trade();
        assert_eq!(
            resolve_target_role(&trade, "buyer-1", Some(RatingTargetRole::Buyer)),
            Some(RatingTargetRole::Buyer)
        );
    }

    #[test]
    fn trade_role_helpers_resolve_expected_users() {
        let trade = fixture_trade();
        assert_eq!(trade.user_in_role(RatingTargetRole::Seller), "seller-1");
        assert_eq!(trade.reviewer_for(RatingTargetRole::Seller), "buyer-1");
        assert_eq!(trade.reviewer_for(RatingTargetRole::Buyer), "seller-1");
    }

    #[test]
    fn quest_request_rejects_zero_reward() {
        let request = CreateQuestRequest {
            interaction_id: None,
            title: "Escort the convoy".to_string(),
            description: "Bring the convoy to the north gate".to_string(),
            reward_rep: 0,
            reward_items: None,
            deadline: None,
            assignee_id: None,
            channel_id: "chan-1".to_string(),
            thread_id: "thread-1".to_string(),
        };
        assert!(matches!(
            request.validate(),
            Err(TradehallError::Validation(_))
        ));
    }

    #[test]
    fn selector_requires_an_id_or_a_thread() {
        let empty = RecordSelector::default();
        assert!(matches!(
            empty.validate(),
            Err(TradehallError::Validation(_))
        ));
        assert!(RecordSelector::by_thread("thread-1").validate().is_ok());
    }

    #[test]
    fn status_tags_round_trip_and_reject_unknown_values() {
        let encoded = must_ok(serde_json::to_string(&TradeStatus::AwaitingRating));
        assert_eq!(encoded, "\"awaiting_rating\"");
        let decoded: TradeStatus = must_ok(serde_json::from_str(&encoded));
        assert_eq!(decoded, TradeStatus::AwaitingRating);

        let unknown: Result<TradeStatus, _> = serde_json::from_str("\"archived\"");
        assert!(unknown.is_err());
        assert_eq!(TradeStatus::parse("awaiting_rating"), Some(TradeStatus::AwaitingRating));
        assert_eq!(TradeStatus::parse("archived"), None);
    }

    #[test]
    fn rep_source_type_rejects_unknown_tags() {
        let unknown: Result<RepSourceType, _> = serde_json::from_str("\"bounty\"");
        assert!(unknown.is_err());
        assert_eq!(RepSourceType::parse("trade_rating"), Some(RepSourceType::TradeRating));
    }

    #[test]
    fn legacy_rating_decodes_camel_case_payloads() {
        let raw = r#"{
            "id": "abc123",
            "tradeId": "trade-7",
            "targetRole": "seller",
            "targetUserId": "user-7",
            "reviewerUserId": "user-8",
            "rating": 1,
            "createdAt": "2025-10-01T00:00:00.000Z"
        }"#;
        let decoded: LegacyRating = must_ok(serde_json::from_str(raw));
        assert_eq!(decoded.trade_id, "trade-7");
        assert_eq!(decoded.target_role, Some(RatingTargetRole::Seller));
        assert_eq!(decoded.reviewer_user_id, "user-8");
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-03-01T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not a timestamp").is_err());
        let parsed = must_utc("2026-03-01T12:00:00Z");
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-03-01T12:00:00Z");
    }

    #[test]
    fn sentiment_amounts_are_signed_units() {
        assert_eq!(RatingSentiment::Positive.amount(), 1);
        assert_eq!(RatingSentiment::Negative.amount(), -1);
        assert_eq!(RatingSentiment::from_amount(-1), Some(RatingSentiment::Negative));
        assert_eq!(RatingSentiment::from_amount(0), None);
    }
}
