use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use wikisync_core::{
    CheckpointEntry, CheckpointOutcome, DirtyMark, DirtyReason, PageState, Phase, Revision, Vote,
    Voter,
};
use wikisync_storage::{ContentRepo, DirtyQueueRepo, MemoryStore, PageRepo, VersionRepo};
use wikisync_sync::testing::{FakePage, ScriptedTransport};
use wikisync_sync::{SyncPipeline, TuningConfig};
use wikisync_upstream::UpstreamError;

fn tuning() -> TuningConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../wikisync.yaml");
    let text = std::fs::read_to_string(&path).expect("shipped tuning file");
    let mut tuning = TuningConfig::from_yaml_str(&text, "wikisync.yaml").expect("tuning");
    tuning.rate_limit.capacity = 1_000_000;
    tuning.rate_limit.refill_per_second = 1_000_000.0;
    tuning.scheduler.base_delay_ms = 1;
    tuning.scheduler.max_delay_ms = 5;
    tuning
}

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<ScriptedTransport>,
    pipeline: SyncPipeline,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::default());
        let pipeline = Self::pipeline_over(&store, &transport, &dir);
        Self {
            store,
            transport,
            pipeline,
            dir,
        }
    }

    fn pipeline_over(
        store: &Arc<MemoryStore>,
        transport: &Arc<ScriptedTransport>,
        dir: &TempDir,
    ) -> SyncPipeline {
        SyncPipeline::from_parts(
            store.clone(),
            transport.clone(),
            tuning(),
            dir.path().join("checkpoints"),
        )
        .expect("pipeline")
    }

    /// A second process over the same store and checkpoint directory.
    fn restart(&self) -> SyncPipeline {
        Self::pipeline_over(&self.store, &self.transport, &self.dir)
    }

    async fn page_id(&self, url: &str) -> i64 {
        self.store
            .page_by_url(url)
            .await
            .expect("read page")
            .expect("page stored")
            .id
    }

    async fn current(&self, page_id: i64) -> PageState {
        self.store
            .current_version(page_id)
            .await
            .expect("read version")
            .expect("current version")
            .state
    }
}

fn ts(day: u32, hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn revision(id: i64, number: i32) -> Revision {
    Revision {
        upstream_revision_id: id,
        revision_number: number,
        user_id: Some(11),
        created_at: ts(1, number as u32),
        change_type: Some("source".into()),
        comment: None,
    }
}

fn scp(upstream_id: i64, rating: i64) -> FakePage {
    FakePage {
        upstream_id,
        title: format!("SCP-{upstream_id:03}"),
        rating,
        vote_count: 2,
        revision_count: 2,
        tags: vec!["scp".into(), "euclid".into()],
        is_deleted: false,
        source: format!("++ Item #: SCP-{upstream_id:03}"),
        text_content: format!("Item #: SCP-{upstream_id:03}"),
        attributions: Vec::new(),
        votes: vec![
            Vote {
                voter: Voter::User(1),
                direction: 1,
                cast_at: ts(2, 0),
            },
            Vote {
                voter: Voter::Anonymous("10.0.0.1".into()),
                direction: -1,
                cast_at: ts(2, 1),
            },
        ],
        revisions: vec![revision(900 + upstream_id, 0), revision(950 + upstream_id, 1)],
    }
}

#[tokio::test]
async fn rating_change_is_marked_for_detail_hydration() {
    let h = Harness::new();
    h.transport.upsert_page("scp-173", scp(173, 100));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-173").await;

    h.transport.update_page("scp-173", |p| p.rating = 120);
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    let scan = h.pipeline.run_phase_a(&checkpoints).await.expect("scan");

    assert_eq!(scan.dirty_marked, 1);
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(row.need_phase_b);
    assert!(!row.done_phase_b);
    assert!(row.reasons.contains(&DirtyReason::RatingChanged));
    assert!(!row.is_pending(Phase::C));
}

#[tokio::test]
async fn detail_hydration_opens_a_version_and_keeps_deep_state() {
    let h = Harness::new();
    h.transport.upsert_page("scp-173", scp(173, 100));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-173").await;
    assert_eq!(h.store.version_count(page_id).await, 1);

    h.transport.update_page("scp-173", |p| p.rating = 120);
    let summary = h.pipeline.run_once().await.expect("second sync");

    assert_eq!(summary.phase_b.new_versions, 1);
    assert_eq!(summary.phase_c.pending, 0);
    assert_eq!(h.store.version_count(page_id).await, 2);
    let current = h.current(page_id).await;
    assert_eq!(current.rating, Some(120));
    assert!(current.is_deep_hydrated());
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(row.done_phase_b);
    assert!(!row.need_phase_b);
    assert!(!row.need_phase_c);

    let checked = h.pipeline.check_pages(&[page_id]).await.expect("check");
    assert_eq!(checked[0].versions, 2);
    assert!(checked[0].issues.is_empty());
}

#[tokio::test]
async fn failed_revision_fetch_commits_nothing_and_retries_next_run() {
    let h = Harness::new();
    h.transport.upsert_page("scp-049", scp(49, 300));
    h.transport.fail_operation(
        "scp-049",
        "PageRevisions",
        UpstreamError::Permanent("revisions unavailable".into()),
        1,
    );

    let first = h.pipeline.run_once().await.expect("first sync");
    let page_id = h.page_id("scp-049").await;
    assert_eq!(first.phase_c.failed, 1);
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(!row.done_phase_c);
    assert!(row.is_pending(Phase::C));
    assert_eq!(row.attempts_c, 1);
    assert!(row.reasons.contains(&DirtyReason::PreviouslyFailed));
    assert!(row.last_error.is_some());
    let version = h
        .store
        .current_version(page_id)
        .await
        .expect("read")
        .expect("current");
    assert!(h.store.votes(version.id).await.expect("votes").is_empty());
    assert!(!version.state.is_deep_hydrated());

    let second = h.pipeline.run_once().await.expect("second sync");
    assert_eq!(second.scan.dirty_marked, 0);
    assert_eq!(second.phase_c.hydrated, 1);
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(row.done_phase_c);
    assert!(row.last_error.is_none());
    assert_eq!(h.store.votes(version.id).await.expect("votes").len(), 2);
    assert_eq!(h.store.revisions(version.id).await.expect("revisions").len(), 2);
}

#[tokio::test]
async fn transient_deep_failure_refetches_the_whole_unit() {
    let h = Harness::new();
    h.transport.upsert_page("scp-096", scp(96, 500));
    h.transport.fail_operation(
        "scp-096",
        "PageVotes",
        UpstreamError::Transient("502 from upstream".into()),
        1,
    );

    let summary = h.pipeline.run_once().await.expect("sync");
    assert_eq!(summary.phase_c.hydrated, 1);
    assert_eq!(summary.phase_c.failed, 0);
    assert_eq!(h.transport.operation_calls("PageContent"), 2);
    assert_eq!(h.transport.operation_calls("PageVotes"), 2);
}

#[tokio::test]
async fn quiet_second_scan_marks_nothing() {
    let h = Harness::new();
    for id in 1..=30 {
        h.transport.upsert_page(&format!("scp-{id:03}"), scp(id, id * 3));
    }
    let first = h.pipeline.run_once().await.expect("first sync");
    assert_eq!(first.scan.new_pages, 30);
    assert_eq!(first.scan.dirty_marked, 30);
    let rows = h.store.dirty_row_count().await;

    let second = h.pipeline.run_once().await.expect("second sync");
    assert!(!second.resumed);
    assert_eq!(second.scan.staged_rows, 30);
    assert_eq!(second.scan.dirty_marked, 0);
    assert_eq!(second.phase_b.pending, 0);
    assert_eq!(second.phase_c.pending, 0);
    assert_eq!(h.store.dirty_row_count().await, rows);
    assert_eq!(second.queue.pending_b + second.queue.pending_c, 0);
}

#[tokio::test]
async fn repeated_detail_hydration_is_idempotent() {
    let h = Harness::new();
    h.transport.upsert_page("scp-682", scp(682, 900));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-682").await;

    for _ in 0..2 {
        let seeded = h
            .pipeline
            .seed_urls(&["scp-682".to_string()])
            .await
            .expect("seed");
        assert_eq!(seeded.marked, vec![page_id]);
        let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
        let report = h.pipeline.run_phase_b(&checkpoints).await.expect("phase b");
        checkpoints.finish().await.expect("finish");
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.new_versions, 0);
    }
    assert_eq!(h.store.version_count(page_id).await, 1);
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(row.done_phase_b);
    assert!(row.reasons.contains(&DirtyReason::ManualRecheck));
}

#[tokio::test]
async fn dirty_page_with_no_real_change_leaves_the_queue_clean() {
    let h = Harness::new();
    h.transport.upsert_page("scp-999", scp(999, 100));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-999").await;

    h.transport.update_page("scp-999", |p| p.rating = 101);
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    h.pipeline.run_phase_a(&checkpoints).await.expect("scan");
    // the vote is retracted before detail hydration runs
    h.transport.update_page("scp-999", |p| p.rating = 100);
    let report = h.pipeline.run_phase_b(&checkpoints).await.expect("phase b");

    assert_eq!(report.unchanged, 1);
    assert_eq!(h.store.version_count(page_id).await, 1);
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(!row.need_phase_b);
    assert!(row.done_phase_b);
}

#[tokio::test]
async fn checkpointed_deep_page_is_not_refetched_in_the_same_run() {
    let h = Harness::new();
    h.transport.upsert_page("scp-055", scp(55, 40));
    let page = h
        .store
        .insert_page(55, "scp-055", ts(1, 0))
        .await
        .expect("insert");
    h.store
        .open_version(page.id, None, &PageState::default(), ts(1, 0))
        .await
        .expect("version");
    h.store
        .mark_dirty(
            page.id,
            &DirtyMark {
                need_phase_c: true,
                reasons: vec![DirtyReason::RevisionCountChanged],
                ..Default::default()
            },
            ts(1, 0),
        )
        .await
        .expect("mark");

    // committed before a crash, completion never recorded
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    checkpoints
        .append(&CheckpointEntry::for_page(Phase::C, page.id, CheckpointOutcome::Hydrated))
        .await
        .expect("append");
    let report = h.pipeline.run_phase_c(&checkpoints).await.expect("phase c");
    assert_eq!(report.skipped_checkpointed, 1);
    assert_eq!(report.claimed, 0);
    assert_eq!(h.transport.operation_calls("PageContent"), 0);

    checkpoints.finish().await.expect("finish");
    let next = h.pipeline.open_checkpoints().await.expect("next run");
    let report = h.pipeline.run_phase_c(&next).await.expect("phase c again");
    assert_eq!(report.hydrated, 1);
    assert_eq!(h.transport.operation_calls("PageContent"), 1);
}

#[tokio::test]
async fn votes_stay_unique_across_hydrations() {
    let h = Harness::new();
    h.transport.upsert_page("scp-106", scp(106, 700));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-106").await;

    h.transport.update_page("scp-106", |p| {
        p.revision_count += 10;
        p.vote_count += 1;
        p.votes.push(Vote {
            voter: Voter::User(7),
            direction: 1,
            cast_at: ts(3, 0),
        });
        // re-cast by the same user keeps its own row
        p.votes.push(Vote {
            voter: Voter::User(1),
            direction: -1,
            cast_at: ts(4, 0),
        });
    });
    let summary = h.pipeline.run_once().await.expect("second sync");
    assert_eq!(summary.phase_c.hydrated, 1);

    let version = h
        .store
        .current_version(page_id)
        .await
        .expect("read")
        .expect("current");
    let votes = h.store.votes(version.id).await.expect("votes");
    let keys = votes.iter().map(Vote::natural_key).collect::<HashSet<_>>();
    assert_eq!(votes.len(), 4);
    assert_eq!(keys.len(), votes.len());

    h.store
        .mark_dirty(
            page_id,
            &DirtyMark {
                need_phase_c: true,
                reasons: vec![DirtyReason::ManualRecheck],
                ..Default::default()
            },
            Utc::now(),
        )
        .await
        .expect("mark");
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    let report = h.pipeline.run_phase_c(&checkpoints).await.expect("phase c");
    assert_eq!(report.hydrated, 1);
    assert_eq!(h.store.votes(version.id).await.expect("votes").len(), 4);
}

#[tokio::test]
async fn url_reused_by_another_page_fails_detail_hydration() {
    let h = Harness::new();
    h.transport.upsert_page("scp-8900", scp(8900, 50));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-8900").await;

    h.transport.upsert_page("scp-8900", scp(8901, 5));
    h.pipeline
        .seed_urls(&["scp-8900".to_string()])
        .await
        .expect("seed");
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    let report = h.pipeline.run_phase_b(&checkpoints).await.expect("phase b");

    assert_eq!(report.identity_conflicts, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.version_count(page_id).await, 1);
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(row.is_pending(Phase::B));
    assert!(row
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("identity conflict")));
    assert_eq!(h.store.identity_conflicts().await.expect("conflicts").len(), 1);
}

#[tokio::test]
async fn renamed_page_keeps_its_history() {
    let h = Harness::new();
    h.transport.upsert_page("scp-5000", scp(5000, 800));
    h.pipeline.run_once().await.expect("initial sync");
    let page_id = h.page_id("scp-5000").await;

    h.transport.rename_page("scp-5000", "scp-5000-ex");
    h.transport.update_page("scp-5000-ex", |p| p.rating = 810);
    let summary = h.pipeline.run_once().await.expect("second sync");

    assert_eq!(summary.scan.renamed_pages, 1);
    assert_eq!(summary.scan.new_pages, 0);
    assert_eq!(h.page_id("scp-5000-ex").await, page_id);
    assert!(h.store.page_by_url("scp-5000").await.expect("read").is_none());
    assert_eq!(h.store.version_count(page_id).await, 2);
    assert_eq!(h.current(page_id).await.rating, Some(810));
}

#[tokio::test]
async fn deleted_pages_close_out_without_deep_work() {
    let h = Harness::new();
    h.transport.upsert_page("scp-flagged", scp(1, 10));
    h.transport.upsert_page("scp-vanished", scp(2, 20));
    h.pipeline.run_once().await.expect("initial sync");
    let flagged = h.page_id("scp-flagged").await;
    let vanished = h.page_id("scp-vanished").await;

    h.transport.update_page("scp-flagged", |p| p.is_deleted = true);
    let summary = h.pipeline.run_once().await.expect("flagged sync");
    assert_eq!(summary.phase_b.deleted, 1);
    assert!(h.current(flagged).await.is_deleted);
    let row = h.store.dirty_page(flagged).await.expect("read").expect("row");
    assert!(row.reasons.contains(&DirtyReason::DeletionChanged));
    assert!(!row.need_phase_c);

    h.transport.remove_page("scp-vanished");
    h.pipeline
        .seed_urls(&["scp-vanished".to_string()])
        .await
        .expect("seed");
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    let report = h.pipeline.run_phase_b(&checkpoints).await.expect("phase b");
    assert_eq!(report.deleted, 1);
    let state = h.current(vanished).await;
    assert!(state.is_deleted);
    assert_eq!(state.rating, Some(20));
}

#[tokio::test]
async fn interrupted_scan_resumes_after_the_last_cursor() {
    let h = Harness::new();
    for id in 1..=12 {
        h.transport.upsert_page(&format!("scp-{id:03}"), scp(id, 1));
    }
    let checkpoints = h.pipeline.open_checkpoints().await.expect("checkpoints");
    checkpoints
        .append(&CheckpointEntry::for_cursor("c3"))
        .await
        .expect("append cursor");
    drop(checkpoints);

    let resumed = h.pipeline.open_checkpoints().await.expect("reopen");
    assert!(resumed.resumed());
    let scan = h.pipeline.run_phase_a(&resumed).await.expect("scan");
    assert_eq!(scan.resumed_after.as_deref(), Some("c3"));
    assert_eq!(scan.staged_rows, 9);
    assert_eq!(scan.new_pages, 9);

    // a second attempt in the same run goes straight to the diff
    let again = h.pipeline.run_phase_a(&resumed).await.expect("scan again");
    assert_eq!(again.catalog_pages, 0);
    assert_eq!(again.staged_rows, 9);
    assert_eq!(again.new_pages, 0);
}

#[tokio::test]
async fn cancelled_run_is_resumed_by_the_next_process() {
    let h = Harness::new();
    h.transport.upsert_page("scp-002", scp(2, 60));
    h.pipeline.cancel_token().cancel();
    let cancelled = h.pipeline.run_once().await.expect("cancelled sync");
    assert!(cancelled.cancelled);
    assert!(cancelled.scan.cancelled);
    assert_eq!(cancelled.phase_b.pending, 0);
    assert_eq!(h.transport.total_calls(), 0);

    let restarted = h.restart();
    let summary = restarted.run_once().await.expect("resumed sync");
    assert!(summary.resumed);
    assert_eq!(summary.run_id, cancelled.run_id);
    assert!(!summary.cancelled);
    assert_eq!(summary.phase_b.new_versions, 1);
}

#[tokio::test]
async fn rate_limited_item_is_released_not_failed() {
    let h = Harness::new();
    h.transport.upsert_page("scp-3000", scp(3000, 1000));
    h.transport.upsert_page("scp-3001", scp(3001, 10));
    h.transport.fail_alias(
        "scp-3000",
        UpstreamError::RateLimited {
            retry_after: Some(Duration::from_millis(10)),
        },
        1,
    );

    let summary = h.pipeline.run_once().await.expect("sync");
    assert_eq!(summary.phase_b.released, 1);
    assert_eq!(summary.phase_b.failed, 0);
    assert_eq!(summary.phase_b.new_versions, 1);
    let page_id = h.page_id("scp-3000").await;
    let row = h.store.dirty_page(page_id).await.expect("read").expect("row");
    assert!(row.is_pending(Phase::B));
    assert_eq!(row.attempts_b, 0);
    assert!(row.lease_b.is_none());

    let next = h.pipeline.run_once().await.expect("next sync");
    assert_eq!(next.phase_b.new_versions, 1);
}

#[tokio::test]
async fn seeding_unknown_urls_is_reported() {
    let h = Harness::new();
    h.transport.upsert_page("scp-001", scp(1, 10));
    h.pipeline.run_once().await.expect("sync");

    let report = h
        .pipeline
        .seed_urls(&["scp-001".to_string(), "scp-404".to_string()])
        .await
        .expect("seed");
    assert_eq!(report.marked.len(), 1);
    assert_eq!(report.unknown, vec!["scp-404".to_string()]);
    let queue = h.pipeline.queue_summary().await.expect("summary");
    assert_eq!(queue.pending_b, 1);
}
