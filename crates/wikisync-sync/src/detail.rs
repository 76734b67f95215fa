//! Phase B: cheap detail hydration of dirty pages.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use wikisync_core::{CheckpointOutcome, DeepIntent, IdentityConflict, PageState, Phase};
use wikisync_storage::{DirtyQueueRepo, PageRepo, StoreError, SyncStore, VersionRepo};
use wikisync_upstream::parse::{parse_detail, DetailRecord};
use wikisync_upstream::{BatchItem, FetchShape, UpstreamError};

use crate::phase::{CommitError, Committed, Committer, PhaseContext, VERSION_RETRIES};

/// Decide the deep-content intent from the state before and after this fetch.
pub(crate) fn decide_deep(before: Option<&PageState>, fetched: &PageState) -> DeepIntent {
    if fetched.is_deleted {
        return DeepIntent::Clear;
    }
    match before {
        Some(before) if before.revision_count == fetched.revision_count && before.is_deep_hydrated() => {
            DeepIntent::Keep
        }
        _ => DeepIntent::Require,
    }
}

/// Write the fetched detail against the page's current version. A new version is opened only
/// when a detail field actually differs.
async fn apply_detail(
    store: &dyn SyncStore,
    page_id: i64,
    record: Option<&DetailRecord>,
) -> Result<Committed, StoreError> {
    let current = store.current_version(page_id).await?;
    let before = current.as_ref().map(|v| &v.state);
    let expected = current.as_ref().map(|v| v.id);

    let Some(record) = record else {
        // answered null: gone upstream
        if before.is_some_and(|s| s.is_deleted) {
            return Ok(Committed {
                outcome: CheckpointOutcome::Unchanged,
                deep: DeepIntent::Clear,
            });
        }
        let state = before.cloned().unwrap_or_default().deleted();
        store.open_version(page_id, expected, &state, Utc::now()).await?;
        return Ok(Committed {
            outcome: CheckpointOutcome::Deleted,
            deep: DeepIntent::Clear,
        });
    };

    let deep = decide_deep(before, &record.state);
    let changed = before.map_or(true, |s| s.detail_differs(&record.state));
    if !changed {
        return Ok(Committed {
            outcome: CheckpointOutcome::Unchanged,
            deep,
        });
    }

    let state = before.cloned().unwrap_or_default().with_detail(&record.state);
    store.open_version(page_id, expected, &state, Utc::now()).await?;
    let outcome = if state.is_deleted {
        CheckpointOutcome::Deleted
    } else {
        CheckpointOutcome::NewVersion
    };
    Ok(Committed { outcome, deep })
}

pub(crate) struct DetailCommitter;

#[async_trait]
impl Committer for DetailCommitter {
    fn phase(&self) -> Phase {
        Phase::B
    }

    fn shape(&self) -> FetchShape {
        FetchShape::Detail
    }

    async fn commit(
        &self,
        ctx: &PhaseContext<'_>,
        item: &BatchItem,
        values: &[Value],
    ) -> Result<Committed, CommitError> {
        let value = values.first().ok_or_else(|| {
            UpstreamError::Permanent(format!("no detail answer for page {}", item.page_id))
        })?;
        let record = parse_detail(value)?;

        let page = ctx
            .store
            .page(item.page_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "page",
                id: item.page_id.to_string(),
            })?;
        if let Some(record) = &record {
            if record.upstream_id != page.upstream_id {
                return Err(CommitError::Conflict(IdentityConflict {
                    page_id: page.id,
                    url: page.url.clone(),
                    known_upstream_id: page.upstream_id,
                    observed_upstream_id: record.upstream_id,
                    observed_at: Utc::now(),
                }));
            }
        }

        let mut attempt = 1;
        loop {
            match apply_detail(ctx.store, page.id, record.as_ref()).await {
                Err(StoreError::VersionConflict { .. }) if attempt < VERSION_RETRIES => {
                    debug!(page_id = page.id, attempt, "current version moved; re-reading");
                    attempt += 1;
                }
                other => return other.map_err(CommitError::from),
            }
        }
    }

    async fn complete(
        &self,
        ctx: &PhaseContext<'_>,
        page_id: i64,
        committed: Committed,
    ) -> Result<bool, StoreError> {
        ctx.store
            .complete_phase_b(page_id, ctx.owner, committed.deep, Utc::now())
            .await
    }
}
