//! Phase C: deep hydration. Content, votes and revisions are fetched as one unit and committed
//! only when all three answered.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use wikisync_core::{CheckpointOutcome, DeepContent, DirtyMark, DirtyReason, PageState, Phase};
use wikisync_storage::{
    ContentRepo, DirtyQueueRepo, MergeCounts, StoreError, SyncStore, VersionRepo,
};
use wikisync_upstream::parse::parse_deep;
use wikisync_upstream::{BatchItem, FetchShape};

use crate::phase::{CommitError, Committed, Committer, PhaseContext, VERSION_RETRIES};

/// Attach `content` to the page's current version, opening a new one when the source moved.
async fn apply_deep(
    store: &dyn SyncStore,
    page_id: i64,
    content: &DeepContent,
) -> Result<(CheckpointOutcome, MergeCounts), StoreError> {
    let current = store.current_version(page_id).await?;
    let now = Utc::now();
    let (version_id, outcome) = match current {
        None => {
            let state = PageState {
                source: content.source.clone(),
                text_content: content.text_content.clone(),
                ..Default::default()
            };
            let opened = store.open_version(page_id, None, &state, now).await?;
            (opened.id, CheckpointOutcome::NewVersion)
        }
        Some(version) if !version.state.is_deep_hydrated() => {
            store
                .fill_deep_fields(
                    version.id,
                    content.source.as_deref(),
                    content.text_content.as_deref(),
                )
                .await?;
            (version.id, CheckpointOutcome::Hydrated)
        }
        Some(version)
            if version.state.source == content.source
                && version.state.text_content == content.text_content =>
        {
            (version.id, CheckpointOutcome::Hydrated)
        }
        Some(version) => {
            let state = PageState {
                source: content.source.clone(),
                text_content: content.text_content.clone(),
                ..version.state.clone()
            };
            let opened = store
                .open_version(page_id, Some(version.id), &state, now)
                .await?;
            (opened.id, CheckpointOutcome::NewVersion)
        }
    };

    let merged = store.merge_deep_content(version_id, content).await?;
    Ok((outcome, merged))
}

pub(crate) struct DeepCommitter;

#[async_trait]
impl Committer for DeepCommitter {
    fn phase(&self) -> Phase {
        Phase::C
    }

    fn shape(&self) -> FetchShape {
        FetchShape::Deep
    }

    async fn commit(
        &self,
        ctx: &PhaseContext<'_>,
        item: &BatchItem,
        values: &[Value],
    ) -> Result<Committed, CommitError> {
        let Some(content) = parse_deep(values)? else {
            // gone upstream; let Phase B record the deletion
            info!(page_id = item.page_id, url = %item.url, "page vanished during deep fetch");
            let mark = DirtyMark {
                need_phase_b: true,
                reasons: vec![DirtyReason::DeletionChanged],
                ..Default::default()
            };
            ctx.store.mark_dirty(item.page_id, &mark, Utc::now()).await?;
            return Ok(Committed::new(CheckpointOutcome::Deleted));
        };

        let mut attempt = 1;
        loop {
            match apply_deep(ctx.store, item.page_id, &content).await {
                Ok((outcome, merged)) => {
                    debug!(
                        page_id = item.page_id,
                        attributions = merged.attributions,
                        votes = merged.votes,
                        revisions = merged.revisions,
                        "merged deep content"
                    );
                    return Ok(Committed::new(outcome));
                }
                Err(StoreError::VersionConflict { .. }) if attempt < VERSION_RETRIES => {
                    debug!(page_id = item.page_id, attempt, "current version moved; re-reading");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn complete(
        &self,
        ctx: &PhaseContext<'_>,
        page_id: i64,
        _committed: Committed,
    ) -> Result<bool, StoreError> {
        ctx.store.complete_phase_c(page_id, ctx.owner, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wikisync_core::{Vote, Voter};
    use wikisync_storage::MemoryStore;

    fn content(source: &str, voters: &[i64]) -> DeepContent {
        DeepContent {
            source: Some(source.to_string()),
            text_content: Some(source.to_uppercase()),
            votes: voters
                .iter()
                .map(|id| Vote {
                    voter: Voter::User(*id),
                    direction: 1,
                    cast_at: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).single().expect("ts"),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn detail_only() -> PageState {
        PageState {
            rating: Some(10),
            revision_count: Some(3),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_hydration_fills_the_current_version() {
        let store = MemoryStore::new();
        let seeded = store
            .open_version(1, None, &detail_only(), Utc::now())
            .await
            .expect("seed");

        let (outcome, merged) = apply_deep(&store, 1, &content("body", &[1, 2]))
            .await
            .expect("apply");
        assert_eq!(outcome, CheckpointOutcome::Hydrated);
        assert_eq!(merged.votes, 2);
        assert_eq!(store.version_count(1).await, 1);
        let current = store.current_version(1).await.expect("read").expect("current");
        assert_eq!(current.id, seeded.id);
        assert_eq!(current.state.source.as_deref(), Some("body"));
        assert_eq!(current.state.rating, Some(10));
    }

    #[tokio::test]
    async fn repeat_hydration_only_appends_new_records() {
        let store = MemoryStore::new();
        store
            .open_version(1, None, &detail_only(), Utc::now())
            .await
            .expect("seed");
        apply_deep(&store, 1, &content("body", &[1, 2])).await.expect("first");

        let (outcome, merged) = apply_deep(&store, 1, &content("body", &[2, 3]))
            .await
            .expect("second");
        assert_eq!(outcome, CheckpointOutcome::Hydrated);
        assert_eq!(merged.votes, 1);
        let current = store.current_version(1).await.expect("read").expect("current");
        // vote 1 vanished upstream but stays on record
        assert_eq!(store.votes(current.id).await.expect("votes").len(), 3);
    }

    #[tokio::test]
    async fn changed_source_opens_a_new_version() {
        let store = MemoryStore::new();
        store
            .open_version(1, None, &detail_only(), Utc::now())
            .await
            .expect("seed");
        apply_deep(&store, 1, &content("body", &[1])).await.expect("first");

        let (outcome, _) = apply_deep(&store, 1, &content("edited body", &[1]))
            .await
            .expect("second");
        assert_eq!(outcome, CheckpointOutcome::NewVersion);
        assert_eq!(store.version_count(1).await, 2);
        let current = store.current_version(1).await.expect("read").expect("current");
        assert_eq!(current.state.source.as_deref(), Some("edited body"));
        assert_eq!(current.state.rating, Some(10));
        assert_eq!(store.votes(current.id).await.expect("votes").len(), 1);
    }
}
