//! In-memory store with the same conditional-update semantics as [`crate::PgStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use wikisync_core::{
    Attribution, DeepContent, DeepIntent, DirtyMark, DirtyPage, DirtyReason, IdentityConflict,
    Lease, Page, PageMetaStaging, PageState, PageVersion, Phase, QueueSummary, Revision, Vote,
};

use crate::{
    ContentRepo, DirtyQueueRepo, MergeCounts, PageRepo, StagingRepo, StoreError, VersionRepo,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_page_id: i64,
    next_version_id: i64,
    pages: BTreeMap<i64, Page>,
    versions: BTreeMap<i64, PageVersion>,
    staging: BTreeMap<String, PageMetaStaging>,
    dirty: BTreeMap<i64, DirtyPage>,
    attributions: BTreeMap<i64, Vec<Attribution>>,
    votes: BTreeMap<i64, Vec<Vote>>,
    revisions: BTreeMap<i64, Vec<Revision>>,
    conflicts: Vec<IdentityConflict>,
}

impl MemoryState {
    fn current_version(&self, page_id: i64) -> Option<&PageVersion> {
        self.versions
            .values()
            .find(|v| v.page_id == page_id && v.is_current())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn version_count(&self, page_id: i64) -> usize {
        let state = self.state.lock().await;
        state.versions.values().filter(|v| v.page_id == page_id).count()
    }

    pub async fn dirty_row_count(&self) -> usize {
        self.state.lock().await.dirty.len()
    }
}

#[async_trait]
impl PageRepo for MemoryStore {
    async fn page(&self, page_id: i64) -> Result<Option<Page>, StoreError> {
        Ok(self.state.lock().await.pages.get(&page_id).cloned())
    }

    async fn page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.pages.values().find(|p| p.url == url).cloned())
    }

    async fn page_by_upstream_id(&self, upstream_id: i64) -> Result<Option<Page>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .pages
            .values()
            .find(|p| p.upstream_id == upstream_id)
            .cloned())
    }

    async fn insert_page(
        &self,
        upstream_id: i64,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Page, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .pages
            .values()
            .find(|p| p.upstream_id == upstream_id || p.url == url)
        {
            let key = if existing.upstream_id == upstream_id {
                format!("upstream_id={upstream_id}")
            } else {
                format!("url={url}")
            };
            return Err(StoreError::Duplicate { entity: "page", key });
        }
        state.next_page_id += 1;
        let page = Page {
            id: state.next_page_id,
            upstream_id,
            url: url.to_string(),
            first_seen_at: now,
            updated_at: now,
        };
        state.pages.insert(page.id, page.clone());
        Ok(page)
    }

    async fn update_page_url(
        &self,
        page_id: i64,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let page = state.pages.get_mut(&page_id).ok_or(StoreError::NotFound {
            entity: "page",
            id: page_id.to_string(),
        })?;
        page.url = url.to_string();
        page.updated_at = now;
        Ok(())
    }

    async fn record_identity_conflict(
        &self,
        conflict: &IdentityConflict,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let known = state.conflicts.iter().any(|c| {
            c.url == conflict.url && c.observed_upstream_id == conflict.observed_upstream_id
        });
        if known {
            return Ok(false);
        }
        state.conflicts.push(conflict.clone());
        Ok(true)
    }

    async fn identity_conflicts(&self) -> Result<Vec<IdentityConflict>, StoreError> {
        Ok(self.state.lock().await.conflicts.clone())
    }
}

#[async_trait]
impl StagingRepo for MemoryStore {
    async fn clear_staging(&self) -> Result<(), StoreError> {
        self.state.lock().await.staging.clear();
        Ok(())
    }

    async fn upsert_staging(&self, rows: &[PageMetaStaging]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for row in rows {
            state.staging.insert(row.url.clone(), row.clone());
        }
        Ok(())
    }

    async fn staging_rows(&self) -> Result<Vec<PageMetaStaging>, StoreError> {
        Ok(self.state.lock().await.staging.values().cloned().collect())
    }
}

#[async_trait]
impl VersionRepo for MemoryStore {
    async fn current_version(&self, page_id: i64) -> Result<Option<PageVersion>, StoreError> {
        Ok(self.state.lock().await.current_version(page_id).cloned())
    }

    async fn versions(&self, page_id: i64) -> Result<Vec<PageVersion>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .values()
            .filter(|v| v.page_id == page_id)
            .cloned()
            .collect())
    }

    async fn open_version(
        &self,
        page_id: i64,
        expected_current: Option<i64>,
        page_state: &PageState,
        now: DateTime<Utc>,
    ) -> Result<PageVersion, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.current_version(page_id).map(|v| (v.id, v.valid_from));
        let found = current.map(|(id, _)| id);
        if found != expected_current {
            return Err(StoreError::VersionConflict {
                page_id,
                expected: expected_current,
                found,
            });
        }

        let mut valid_from = now;
        if let Some((current_id, current_from)) = current {
            valid_from = now.max(current_from);
            if let Some(v) = state.versions.get_mut(&current_id) {
                v.valid_to = Some(valid_from);
            }
        }

        state.next_version_id += 1;
        let version = PageVersion {
            id: state.next_version_id,
            page_id,
            state: page_state.clone(),
            valid_from,
            valid_to: None,
        };
        state.versions.insert(version.id, version.clone());
        Ok(version)
    }

    async fn fill_deep_fields(
        &self,
        version_id: i64,
        source: Option<&str>,
        text_content: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let version = state
            .versions
            .get_mut(&version_id)
            .ok_or(StoreError::NotFound {
                entity: "page_version",
                id: version_id.to_string(),
            })?;
        version.state.source = source.map(ToString::to_string);
        version.state.text_content = text_content.map(ToString::to_string);
        Ok(())
    }
}

#[async_trait]
impl ContentRepo for MemoryStore {
    async fn merge_deep_content(
        &self,
        version_id: i64,
        content: &DeepContent,
    ) -> Result<MergeCounts, StoreError> {
        let mut state = self.state.lock().await;
        if !state.versions.contains_key(&version_id) {
            return Err(StoreError::NotFound {
                entity: "page_version",
                id: version_id.to_string(),
            });
        }
        let mut counts = MergeCounts::default();

        let attributions = state.attributions.entry(version_id).or_default();
        for a in &content.attributions {
            if !attributions.iter().any(|x| x.natural_key() == a.natural_key()) {
                attributions.push(a.clone());
                counts.attributions += 1;
            }
        }

        let votes = state.votes.entry(version_id).or_default();
        for v in &content.votes {
            if !votes.iter().any(|x| x.natural_key() == v.natural_key()) {
                votes.push(v.clone());
                counts.votes += 1;
            }
        }

        let revisions = state.revisions.entry(version_id).or_default();
        for r in &content.revisions {
            if !revisions
                .iter()
                .any(|x| x.upstream_revision_id == r.upstream_revision_id)
            {
                revisions.push(r.clone());
                counts.revisions += 1;
            }
        }

        Ok(counts)
    }

    async fn attributions(&self, version_id: i64) -> Result<Vec<Attribution>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.attributions.get(&version_id).cloned().unwrap_or_default())
    }

    async fn votes(&self, version_id: i64) -> Result<Vec<Vote>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.votes.get(&version_id).cloned().unwrap_or_default())
    }

    async fn revisions(&self, version_id: i64) -> Result<Vec<Revision>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.revisions.get(&version_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DirtyQueueRepo for MemoryStore {
    async fn mark_dirty(
        &self,
        page_id: i64,
        mark: &DirtyMark,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .dirty
            .entry(page_id)
            .or_insert_with(|| DirtyPage::new(page_id, now))
            .apply_mark(mark, now);
        Ok(())
    }

    async fn dirty_page(&self, page_id: i64) -> Result<Option<DirtyPage>, StoreError> {
        Ok(self.state.lock().await.dirty.get(&page_id).cloned())
    }

    async fn pending(
        &self,
        phase: Phase,
        limit: Option<usize>,
    ) -> Result<Vec<DirtyPage>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .dirty
            .values()
            .filter(|d| d.is_pending(phase))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|d| (d.estimated_cost, d.page_id));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn claim(
        &self,
        page_id: i64,
        phase: Phase,
        lease: Lease,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.dirty.get_mut(&page_id) else {
            return Ok(false);
        };
        if !row.is_pending(phase) {
            return Ok(false);
        }
        let Some(slot) = row.lease_mut(phase) else {
            return Ok(false);
        };
        let free = match slot {
            None => true,
            Some(held) => held.is_expired(lease.claimed_at, ttl),
        };
        if !free {
            return Ok(false);
        }
        *slot = Some(lease);
        row.updated_at = lease.claimed_at;
        Ok(true)
    }

    async fn complete_phase_b(
        &self,
        page_id: i64,
        owner: Uuid,
        deep: DeepIntent,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.dirty.get_mut(&page_id) else {
            return Ok(false);
        };
        if !row.is_held_by(Phase::B, owner) {
            return Ok(false);
        }
        row.done_phase_b = true;
        row.need_phase_b = false;
        row.lease_b = None;
        row.last_error = None;
        row.completed_b_at = Some(now);
        row.updated_at = now;
        match deep {
            DeepIntent::Keep => {}
            DeepIntent::Require => {
                row.need_phase_c = true;
                row.done_phase_c = false;
            }
            DeepIntent::Clear => row.need_phase_c = false,
        }
        Ok(true)
    }

    async fn complete_phase_c(
        &self,
        page_id: i64,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.dirty.get_mut(&page_id) else {
            return Ok(false);
        };
        if !row.is_held_by(Phase::C, owner) {
            return Ok(false);
        }
        row.done_phase_c = true;
        row.need_phase_c = false;
        row.lease_c = None;
        row.last_error = None;
        row.completed_c_at = Some(now);
        row.updated_at = now;
        Ok(true)
    }

    async fn record_failure(
        &self,
        page_id: i64,
        phase: Phase,
        owner: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.dirty.get_mut(&page_id) else {
            return Ok(false);
        };
        if !row.is_held_by(phase, owner) {
            return Ok(false);
        }
        match phase {
            Phase::B => {
                row.lease_b = None;
                row.attempts_b += 1;
            }
            Phase::C => {
                row.lease_c = None;
                row.attempts_c += 1;
            }
            Phase::A => return Ok(false),
        }
        if !row.reasons.contains(&DirtyReason::PreviouslyFailed) {
            row.reasons.push(DirtyReason::PreviouslyFailed);
        }
        row.last_error = Some(error.to_string());
        row.updated_at = now;
        Ok(true)
    }

    async fn release(&self, page_id: i64, phase: Phase, owner: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.dirty.get_mut(&page_id) else {
            return Ok(false);
        };
        if !row.is_held_by(phase, owner) {
            return Ok(false);
        }
        if let Some(slot) = row.lease_mut(phase) {
            *slot = None;
        }
        Ok(true)
    }

    async fn queue_summary(&self) -> Result<QueueSummary, StoreError> {
        let state = self.state.lock().await;
        let mut summary = QueueSummary {
            total: state.dirty.len(),
            ..Default::default()
        };
        for row in state.dirty.values() {
            summary.pending_b += usize::from(row.is_pending(Phase::B));
            summary.pending_c += usize::from(row.is_pending(Phase::C));
            summary.leased_b += usize::from(row.lease_b.is_some());
            summary.leased_c += usize::from(row.lease_c.is_some());
            summary.with_errors += usize::from(row.last_error.is_some());
        }
        Ok(summary)
    }
}
