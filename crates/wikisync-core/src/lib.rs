//! Core domain model for the wiki mirror: pages, bitemporal versions, staging
//! fingerprints, dirty-queue work items and the append-only child records.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wikisync-core";

/// Pipeline phase: metadata scan, cheap detail hydration, deep content hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::A => "phase_a",
            Phase::B => "phase_b",
            Phase::C => "phase_c",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "phase_a" => Ok(Phase::A),
            "b" | "phase_b" => Ok(Phase::B),
            "c" | "phase_c" => Ok(Phase::C),
            other => Err(format!("unknown phase `{other}`")),
        }
    }
}

/// Stable identity of one upstream document. The upstream id never changes; the URL can.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub upstream_id: i64,
    pub url: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Observable state of a page as captured by one version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageState {
    pub title: Option<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<i64>,
    pub revision_count: Option<i64>,
    pub tags: BTreeSet<String>,
    pub is_deleted: bool,
    /// Filled by Phase C.
    pub source: Option<String>,
    pub text_content: Option<String>,
}

impl PageState {
    /// True when any field of the cheap detail shape differs from `fetched`.
    pub fn detail_differs(&self, fetched: &PageState) -> bool {
        self.title != fetched.title
            || self.rating != fetched.rating
            || self.vote_count != fetched.vote_count
            || self.revision_count != fetched.revision_count
            || self.tags != fetched.tags
            || self.is_deleted != fetched.is_deleted
    }

    /// Detail fields from `fetched`, deep fields kept from `self`.
    pub fn with_detail(&self, fetched: &PageState) -> PageState {
        PageState {
            title: fetched.title.clone(),
            rating: fetched.rating,
            vote_count: fetched.vote_count,
            revision_count: fetched.revision_count,
            tags: fetched.tags.clone(),
            is_deleted: fetched.is_deleted,
            source: self.source.clone(),
            text_content: self.text_content.clone(),
        }
    }

    /// Same state, flagged deleted.
    pub fn deleted(&self) -> PageState {
        PageState {
            is_deleted: true,
            ..self.clone()
        }
    }

    pub fn is_deep_hydrated(&self) -> bool {
        self.source.is_some()
    }
}

/// Bitemporal snapshot. `valid_to == None` marks the current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageVersion {
    pub id: i64,
    pub page_id: i64,
    pub state: PageState,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl PageVersion {
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// Lightweight fingerprint captured by the current Phase A pass, one row per URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetaStaging {
    pub url: String,
    pub upstream_id: i64,
    pub title: Option<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<i64>,
    pub revision_count: Option<i64>,
    pub tags: BTreeSet<String>,
    pub is_deleted: bool,
    pub estimated_cost: u32,
    pub last_seen_at: DateTime<Utc>,
}

impl PageMetaStaging {
    /// Reasons this fingerprint disagrees with the stored current state, in predicate order.
    pub fn diff_reasons(&self, current: Option<&PageState>) -> Vec<DirtyReason> {
        let Some(current) = current else {
            return vec![DirtyReason::NewlyDiscovered];
        };
        let mut reasons = Vec::new();
        if self.rating != current.rating {
            reasons.push(DirtyReason::RatingChanged);
        }
        if self.vote_count != current.vote_count {
            reasons.push(DirtyReason::VoteCountChanged);
        }
        if self.revision_count != current.revision_count {
            reasons.push(DirtyReason::RevisionCountChanged);
        }
        if self.tags != current.tags {
            reasons.push(DirtyReason::TagsChanged);
        }
        if self.is_deleted != current.is_deleted {
            reasons.push(DirtyReason::DeletionChanged);
        }
        reasons
    }

    /// Forward revision movement since `current`, zero when unknown or not increasing.
    pub fn revision_jump(&self, current: Option<&PageState>) -> i64 {
        let before = current.and_then(|c| c.revision_count).unwrap_or(0);
        let after = self.revision_count.unwrap_or(0);
        (after - before).max(0)
    }
}

/// Closed set of reasons a page can be marked dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyReason {
    NewlyDiscovered,
    RatingChanged,
    VoteCountChanged,
    RevisionCountChanged,
    TagsChanged,
    DeletionChanged,
    PreviouslyFailed,
    ManualRecheck,
}

impl DirtyReason {
    pub const ALL: [DirtyReason; 8] = [
        DirtyReason::NewlyDiscovered,
        DirtyReason::RatingChanged,
        DirtyReason::VoteCountChanged,
        DirtyReason::RevisionCountChanged,
        DirtyReason::TagsChanged,
        DirtyReason::DeletionChanged,
        DirtyReason::PreviouslyFailed,
        DirtyReason::ManualRecheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyReason::NewlyDiscovered => "newly_discovered",
            DirtyReason::RatingChanged => "rating_changed",
            DirtyReason::VoteCountChanged => "vote_count_changed",
            DirtyReason::RevisionCountChanged => "revision_count_changed",
            DirtyReason::TagsChanged => "tags_changed",
            DirtyReason::DeletionChanged => "deletion_changed",
            DirtyReason::PreviouslyFailed => "previously_failed",
            DirtyReason::ManualRecheck => "manual_recheck",
        }
    }
}

impl fmt::Display for DirtyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirtyReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DirtyReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown dirty reason `{s}`"))
    }
}

/// Request to mark a page dirty. Intents OR into the existing row; reasons accumulate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirtyMark {
    pub need_phase_b: bool,
    pub need_phase_c: bool,
    pub reasons: Vec<DirtyReason>,
    pub estimated_cost: Option<u32>,
}

/// Exclusive per-phase claim on a dirty row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: Uuid,
    pub claimed_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: Uuid, claimed_at: DateTime<Utc>) -> Self {
        Self { owner, claimed_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.claimed_at >= ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyPage {
    pub page_id: i64,
    pub need_phase_b: bool,
    pub need_phase_c: bool,
    pub done_phase_b: bool,
    pub done_phase_c: bool,
    pub reasons: Vec<DirtyReason>,
    pub estimated_cost: u32,
    pub last_error: Option<String>,
    pub attempts_b: u32,
    pub attempts_c: u32,
    pub lease_b: Option<Lease>,
    pub lease_c: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_b_at: Option<DateTime<Utc>>,
    pub completed_c_at: Option<DateTime<Utc>>,
}

impl DirtyPage {
    pub fn new(page_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            page_id,
            need_phase_b: false,
            need_phase_c: false,
            done_phase_b: false,
            done_phase_c: false,
            reasons: Vec::new(),
            estimated_cost: 0,
            last_error: None,
            attempts_b: 0,
            attempts_c: 0,
            lease_b: None,
            lease_c: None,
            created_at: now,
            updated_at: now,
            completed_b_at: None,
            completed_c_at: None,
        }
    }

    /// Merge a dirty mark into this row.
    pub fn apply_mark(&mut self, mark: &DirtyMark, now: DateTime<Utc>) {
        if mark.need_phase_b {
            self.need_phase_b = true;
            self.done_phase_b = false;
        }
        if mark.need_phase_c {
            self.need_phase_c = true;
            self.done_phase_c = false;
        }
        for reason in &mark.reasons {
            if !self.reasons.contains(reason) {
                self.reasons.push(*reason);
            }
        }
        if let Some(cost) = mark.estimated_cost {
            self.estimated_cost = cost;
        }
        self.updated_at = now;
    }

    pub fn is_pending(&self, phase: Phase) -> bool {
        match phase {
            Phase::A => false,
            Phase::B => self.need_phase_b && !self.done_phase_b,
            Phase::C => self.need_phase_c && !self.done_phase_c,
        }
    }

    pub fn lease(&self, phase: Phase) -> Option<&Lease> {
        match phase {
            Phase::A => None,
            Phase::B => self.lease_b.as_ref(),
            Phase::C => self.lease_c.as_ref(),
        }
    }

    pub fn lease_mut(&mut self, phase: Phase) -> Option<&mut Option<Lease>> {
        match phase {
            Phase::A => None,
            Phase::B => Some(&mut self.lease_b),
            Phase::C => Some(&mut self.lease_c),
        }
    }

    pub fn is_held_by(&self, phase: Phase, owner: Uuid) -> bool {
        self.lease(phase).is_some_and(|l| l.owner == owner)
    }
}

/// What Phase B decided about the deep-content intent when completing a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepIntent {
    Keep,
    Require,
    /// Page is deleted upstream; deep hydration is pointless.
    Clear,
}

/// Who cast a vote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voter {
    User(i64),
    Anonymous(String),
}

impl Voter {
    /// Stable key used in the `(page_version_id, voter, cast_at)` uniqueness rule.
    pub fn key(&self) -> String {
        match self {
            Voter::User(id) => format!("user:{id}"),
            Voter::Anonymous(anon) => format!("anon:{anon}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: Voter,
    pub direction: i32,
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    pub fn natural_key(&self) -> (String, DateTime<Utc>) {
        (self.voter.key(), self.cast_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub upstream_revision_id: i64,
    pub revision_number: i32,
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub change_type: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub attribution_type: String,
    pub attributed_at: Option<DateTime<Utc>>,
    pub order_index: i32,
}

impl Attribution {
    pub fn natural_key(&self) -> (Option<i64>, String, i32) {
        (self.user_id, self.attribution_type.clone(), self.order_index)
    }
}

/// Everything Phase C fetches for one page. Only committed when complete.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeepContent {
    pub source: Option<String>,
    pub text_content: Option<String>,
    pub attributions: Vec<Attribution>,
    pub votes: Vec<Vote>,
    pub revisions: Vec<Revision>,
}

/// A URL that now answers with a different upstream identity than the stored page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConflict {
    pub page_id: i64,
    pub url: String,
    pub known_upstream_id: i64,
    pub observed_upstream_id: i64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOutcome {
    /// Phase A catalog cursor completed.
    Scanned,
    NewVersion,
    Unchanged,
    Deleted,
    Hydrated,
}

/// One completed work item, one JSON line in a phase-scoped checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub phase: Phase,
    /// Page id for B/C, catalog cursor for A.
    pub key: String,
    pub outcome: CheckpointOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn for_page(phase: Phase, page_id: i64, outcome: CheckpointOutcome) -> Self {
        Self {
            phase,
            key: page_id.to_string(),
            outcome,
            recorded_at: Utc::now(),
        }
    }

    pub fn for_cursor(cursor: &str) -> Self {
        Self {
            phase: Phase::A,
            key: cursor.to_string(),
            outcome: CheckpointOutcome::Scanned,
            recorded_at: Utc::now(),
        }
    }
}

/// Counts reported by the dirty queue for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub pending_b: usize,
    pub pending_c: usize,
    pub leased_b: usize,
    pub leased_c: usize,
    pub with_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionChainIssue {
    MultipleOpen { version_ids: Vec<i64> },
    NoOpenVersion,
    Gap { earlier: i64, later: i64 },
    Overlap { earlier: i64, later: i64 },
    InvertedInterval { version_id: i64 },
}

/// Verify a page's versions are contiguous, non-overlapping and have exactly one open interval.
pub fn check_version_chain(versions: &[PageVersion]) -> Vec<VersionChainIssue> {
    let mut issues = Vec::new();
    if versions.is_empty() {
        return issues;
    }

    let open = versions
        .iter()
        .filter(|v| v.is_current())
        .map(|v| v.id)
        .collect::<Vec<_>>();
    match open.len() {
        0 => issues.push(VersionChainIssue::NoOpenVersion),
        1 => {}
        _ => issues.push(VersionChainIssue::MultipleOpen { version_ids: open }),
    }

    let mut sorted = versions.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|v| (v.valid_from, v.id));

    for v in &sorted {
        if let Some(to) = v.valid_to {
            if to < v.valid_from {
                issues.push(VersionChainIssue::InvertedInterval { version_id: v.id });
            }
        }
    }

    for pair in sorted.windows(2) {
        let (earlier, later) = (pair[0], pair[1]);
        match earlier.valid_to {
            None => issues.push(VersionChainIssue::Overlap {
                earlier: earlier.id,
                later: later.id,
            }),
            Some(to) if to < later.valid_from => issues.push(VersionChainIssue::Gap {
                earlier: earlier.id,
                later: later.id,
            }),
            Some(to) if to > later.valid_from => issues.push(VersionChainIssue::Overlap {
                earlier: earlier.id,
                later: later.id,
            }),
            Some(_) => {}
        }
    }

    issues
}
