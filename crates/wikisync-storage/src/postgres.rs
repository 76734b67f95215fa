//! PostgreSQL repositories. Every dirty-queue mutation is a single-row conditional update.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;
use wikisync_core::{
    Attribution, DeepContent, DeepIntent, DirtyMark, DirtyPage, DirtyReason, IdentityConflict,
    Lease, Page, PageMetaStaging, PageState, PageVersion, Phase, QueueSummary, Revision, Vote,
    Voter,
};

use crate::{
    ContentRepo, DirtyQueueRepo, MergeCounts, PageRepo, StagingRepo, StoreError, VersionRepo,
};

const PAGE_COLUMNS: &str = "id, upstream_id, url, first_seen_at, updated_at";
const VERSION_COLUMNS: &str = "id, page_id, title, rating, vote_count, revision_count, tags, \
     is_deleted, source, text_content, valid_from, valid_to";
const DIRTY_COLUMNS: &str = "page_id, need_phase_b, need_phase_c, done_phase_b, done_phase_c, \
     reasons, estimated_cost, last_error, attempts_b, attempts_c, lease_b_owner, lease_b_at, \
     lease_c_owner, lease_c_at, created_at, updated_at, completed_b_at, completed_c_at";

const CLAIM_B: &str = r#"
    UPDATE dirty_page
       SET lease_b_owner = $2, lease_b_at = $3, updated_at = $3
     WHERE page_id = $1
       AND need_phase_b AND NOT done_phase_b
       AND (lease_b_owner IS NULL OR lease_b_at <= $4)
"#;

const CLAIM_C: &str = r#"
    UPDATE dirty_page
       SET lease_c_owner = $2, lease_c_at = $3, updated_at = $3
     WHERE page_id = $1
       AND need_phase_c AND NOT done_phase_c
       AND (lease_c_owner IS NULL OR lease_c_at <= $4)
"#;

const FAIL_B: &str = r#"
    UPDATE dirty_page
       SET lease_b_owner = NULL, lease_b_at = NULL,
           attempts_b = attempts_b + 1,
           last_error = $3, updated_at = $4,
           reasons = CASE WHEN 'previously_failed' = ANY(reasons) THEN reasons
                          ELSE array_append(reasons, 'previously_failed') END
     WHERE page_id = $1 AND lease_b_owner = $2
"#;

const FAIL_C: &str = r#"
    UPDATE dirty_page
       SET lease_c_owner = NULL, lease_c_at = NULL,
           attempts_c = attempts_c + 1,
           last_error = $3, updated_at = $4,
           reasons = CASE WHEN 'previously_failed' = ANY(reasons) THEN reasons
                          ELSE array_append(reasons, 'previously_failed') END
     WHERE page_id = $1 AND lease_c_owner = $2
"#;

const RELEASE_B: &str =
    "UPDATE dirty_page SET lease_b_owner = NULL, lease_b_at = NULL WHERE page_id = $1 AND lease_b_owner = $2";
const RELEASE_C: &str =
    "UPDATE dirty_page SET lease_c_owner = NULL, lease_c_at = NULL WHERE page_id = $1 AND lease_c_owner = $2";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying mirror schema migrations")?;
        Ok(())
    }
}

fn page_from_row(row: &PgRow) -> Result<Page, sqlx::Error> {
    Ok(Page {
        id: row.try_get("id")?,
        upstream_id: row.try_get("upstream_id")?,
        url: row.try_get("url")?,
        first_seen_at: row.try_get("first_seen_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<PageVersion, sqlx::Error> {
    let tags: Vec<String> = row.try_get("tags")?;
    Ok(PageVersion {
        id: row.try_get("id")?,
        page_id: row.try_get("page_id")?,
        state: PageState {
            title: row.try_get("title")?,
            rating: row.try_get("rating")?,
            vote_count: row.try_get("vote_count")?,
            revision_count: row.try_get("revision_count")?,
            tags: tags.into_iter().collect(),
            is_deleted: row.try_get("is_deleted")?,
            source: row.try_get("source")?,
            text_content: row.try_get("text_content")?,
        },
        valid_from: row.try_get("valid_from")?,
        valid_to: row.try_get("valid_to")?,
    })
}

fn staging_from_row(row: &PgRow) -> Result<PageMetaStaging, sqlx::Error> {
    let tags: Vec<String> = row.try_get("tags")?;
    let cost: i32 = row.try_get("estimated_cost")?;
    Ok(PageMetaStaging {
        url: row.try_get("url")?,
        upstream_id: row.try_get("upstream_id")?,
        title: row.try_get("title")?,
        rating: row.try_get("rating")?,
        vote_count: row.try_get("vote_count")?,
        revision_count: row.try_get("revision_count")?,
        tags: tags.into_iter().collect::<BTreeSet<_>>(),
        is_deleted: row.try_get("is_deleted")?,
        estimated_cost: non_negative(cost),
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn lease_from(owner: Option<Uuid>, at: Option<DateTime<Utc>>) -> Option<Lease> {
    owner.zip(at).map(|(owner, at)| Lease::new(owner, at))
}

fn dirty_from_row(row: &PgRow) -> Result<DirtyPage, StoreError> {
    let reasons: Vec<String> = row.try_get("reasons")?;
    let reasons = reasons
        .iter()
        .map(|r| r.parse::<DirtyReason>().map_err(StoreError::Codec))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DirtyPage {
        page_id: row.try_get("page_id")?,
        need_phase_b: row.try_get("need_phase_b")?,
        need_phase_c: row.try_get("need_phase_c")?,
        done_phase_b: row.try_get("done_phase_b")?,
        done_phase_c: row.try_get("done_phase_c")?,
        reasons,
        estimated_cost: non_negative(row.try_get("estimated_cost")?),
        last_error: row.try_get("last_error")?,
        attempts_b: non_negative(row.try_get("attempts_b")?),
        attempts_c: non_negative(row.try_get("attempts_c")?),
        lease_b: lease_from(row.try_get("lease_b_owner")?, row.try_get("lease_b_at")?),
        lease_c: lease_from(row.try_get("lease_c_owner")?, row.try_get("lease_c_at")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_b_at: row.try_get("completed_b_at")?,
        completed_c_at: row.try_get("completed_c_at")?,
    })
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn tags_vec(tags: &BTreeSet<String>) -> Vec<String> {
    tags.iter().cloned().collect()
}

/// Map a unique violation on `page` to the same error the in-memory store reports.
fn duplicate_page(err: sqlx::Error, upstream_id: i64, url: &str) -> StoreError {
    let constraint = match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            db.constraint().unwrap_or_default().to_string()
        }
        _ => return StoreError::Database(err),
    };
    let key = if constraint.contains("url") {
        format!("url={url}")
    } else {
        format!("upstream_id={upstream_id}")
    };
    StoreError::Duplicate { entity: "page", key }
}

fn unsupported_phase(phase: Phase) -> StoreError {
    StoreError::Codec(format!("{phase} has no dirty-queue lease"))
}

#[async_trait]
impl PageRepo for PgStore {
    async fn page(&self, page_id: i64) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAGE_COLUMNS} FROM page WHERE id = $1"))
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(page_from_row).transpose()?)
    }

    async fn page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAGE_COLUMNS} FROM page WHERE url = $1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(page_from_row).transpose()?)
    }

    async fn page_by_upstream_id(&self, upstream_id: i64) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAGE_COLUMNS} FROM page WHERE upstream_id = $1"
        ))
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(page_from_row).transpose()?)
    }

    async fn insert_page(
        &self,
        upstream_id: i64,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Page, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO page (upstream_id, url, first_seen_at, updated_at)
            VALUES ($1, $2, $3, $3)
            RETURNING {PAGE_COLUMNS}
            "#
        ))
        .bind(upstream_id)
        .bind(url)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| duplicate_page(err, upstream_id, url))?;
        Ok(page_from_row(&row)?)
    }

    async fn update_page_url(
        &self,
        page_id: i64,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE page SET url = $2, updated_at = $3 WHERE id = $1")
            .bind(page_id)
            .bind(url)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "page",
                id: page_id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_identity_conflict(
        &self,
        conflict: &IdentityConflict,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO identity_conflict
                (page_id, url, known_upstream_id, observed_upstream_id, observed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (url, observed_upstream_id) DO NOTHING
            "#,
        )
        .bind(conflict.page_id)
        .bind(&conflict.url)
        .bind(conflict.known_upstream_id)
        .bind(conflict.observed_upstream_id)
        .bind(conflict.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn identity_conflicts(&self) -> Result<Vec<IdentityConflict>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT page_id, url, known_upstream_id, observed_upstream_id, observed_at
              FROM identity_conflict
             ORDER BY observed_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(IdentityConflict {
                page_id: row.try_get("page_id")?,
                url: row.try_get("url")?,
                known_upstream_id: row.try_get("known_upstream_id")?,
                observed_upstream_id: row.try_get("observed_upstream_id")?,
                observed_at: row.try_get("observed_at")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl StagingRepo for PgStore {
    async fn clear_staging(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM page_meta_staging")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_staging(&self, rows: &[PageMetaStaging]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO page_meta_staging
                    (url, upstream_id, title, rating, vote_count, revision_count, tags,
                     is_deleted, estimated_cost, last_seen_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (url) DO UPDATE SET
                    upstream_id = EXCLUDED.upstream_id,
                    title = EXCLUDED.title,
                    rating = EXCLUDED.rating,
                    vote_count = EXCLUDED.vote_count,
                    revision_count = EXCLUDED.revision_count,
                    tags = EXCLUDED.tags,
                    is_deleted = EXCLUDED.is_deleted,
                    estimated_cost = EXCLUDED.estimated_cost,
                    last_seen_at = EXCLUDED.last_seen_at
                "#,
            )
            .bind(&row.url)
            .bind(row.upstream_id)
            .bind(&row.title)
            .bind(row.rating)
            .bind(row.vote_count)
            .bind(row.revision_count)
            .bind(tags_vec(&row.tags))
            .bind(row.is_deleted)
            .bind(as_i32(row.estimated_cost))
            .bind(row.last_seen_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn staging_rows(&self) -> Result<Vec<PageMetaStaging>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT url, upstream_id, title, rating, vote_count, revision_count, tags,
                   is_deleted, estimated_cost, last_seen_at
              FROM page_meta_staging
             ORDER BY url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(staging_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl VersionRepo for PgStore {
    async fn current_version(&self, page_id: i64) -> Result<Option<PageVersion>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM page_version WHERE page_id = $1 AND valid_to IS NULL"
        ))
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(version_from_row).transpose()?)
    }

    async fn versions(&self, page_id: i64) -> Result<Vec<PageVersion>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM page_version WHERE page_id = $1 ORDER BY valid_from, id"
        ))
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(version_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn open_version(
        &self,
        page_id: i64,
        expected_current: Option<i64>,
        state: &PageState,
        now: DateTime<Utc>,
    ) -> Result<PageVersion, StoreError> {
        let mut tx = self.pool.begin().await?;

        // serializes version-chain writers for this page
        let locked = sqlx::query("SELECT id FROM page WHERE id = $1 FOR UPDATE")
            .bind(page_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound {
                entity: "page",
                id: page_id.to_string(),
            });
        }

        let current = sqlx::query(
            "SELECT id, valid_from FROM page_version WHERE page_id = $1 AND valid_to IS NULL",
        )
        .bind(page_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current = match current {
            Some(row) => Some((
                row.try_get::<i64, _>("id")?,
                row.try_get::<DateTime<Utc>, _>("valid_from")?,
            )),
            None => None,
        };

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
            sqlx::query("UPDATE page_version SET valid_to = $2 WHERE id = $1")
                .bind(current_id)
                .bind(valid_from)
                .execute(&mut *tx)
                .await?;
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO page_version
                (page_id, title, rating, vote_count, revision_count, tags, is_deleted,
                 source, text_content, valid_from, valid_to)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL)
            RETURNING {VERSION_COLUMNS}
            "#
        ))
        .bind(page_id)
        .bind(&state.title)
        .bind(state.rating)
        .bind(state.vote_count)
        .bind(state.revision_count)
        .bind(tags_vec(&state.tags))
        .bind(state.is_deleted)
        .bind(&state.source)
        .bind(&state.text_content)
        .bind(valid_from)
        .fetch_one(&mut *tx)
        .await?;
        let version = version_from_row(&row)?;

        tx.commit().await?;
        Ok(version)
    }

    async fn fill_deep_fields(
        &self,
        version_id: i64,
        source: Option<&str>,
        text_content: Option<&str>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE page_version SET source = $2, text_content = $3 WHERE id = $1")
                .bind(version_id)
                .bind(source)
                .bind(text_content)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "page_version",
                id: version_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContentRepo for PgStore {
    async fn merge_deep_content(
        &self,
        version_id: i64,
        content: &DeepContent,
    ) -> Result<MergeCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut counts = MergeCounts::default();

        for a in &content.attributions {
            let result = sqlx::query(
                r#"
                INSERT INTO attribution
                    (page_version_id, user_id, user_name, attribution_type, attributed_at, order_index)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(version_id)
            .bind(a.user_id)
            .bind(&a.user_name)
            .bind(&a.attribution_type)
            .bind(a.attributed_at)
            .bind(a.order_index)
            .execute(&mut *tx)
            .await?;
            counts.attributions += result.rows_affected() as usize;
        }

        for v in &content.votes {
            let (user_id, anon_key) = match &v.voter {
                Voter::User(id) => (Some(*id), None),
                Voter::Anonymous(key) => (None, Some(key.as_str())),
            };
            let result = sqlx::query(
                r#"
                INSERT INTO vote (page_version_id, user_id, anon_key, voter_key, direction, cast_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (page_version_id, voter_key, cast_at) DO NOTHING
                "#,
            )
            .bind(version_id)
            .bind(user_id)
            .bind(anon_key)
            .bind(v.voter.key())
            .bind(v.direction)
            .bind(v.cast_at)
            .execute(&mut *tx)
            .await?;
            counts.votes += result.rows_affected() as usize;
        }

        for r in &content.revisions {
            let result = sqlx::query(
                r#"
                INSERT INTO revision
                    (page_version_id, upstream_revision_id, revision_number, user_id,
                     created_at, change_type, comment)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (page_version_id, upstream_revision_id) DO NOTHING
                "#,
            )
            .bind(version_id)
            .bind(r.upstream_revision_id)
            .bind(r.revision_number)
            .bind(r.user_id)
            .bind(r.created_at)
            .bind(&r.change_type)
            .bind(&r.comment)
            .execute(&mut *tx)
            .await?;
            counts.revisions += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(counts)
    }

    async fn attributions(&self, version_id: i64) -> Result<Vec<Attribution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, user_name, attribution_type, attributed_at, order_index
              FROM attribution WHERE page_version_id = $1 ORDER BY order_index, id
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Attribution {
                user_id: row.try_get("user_id")?,
                user_name: row.try_get("user_name")?,
                attribution_type: row.try_get("attribution_type")?,
                attributed_at: row.try_get("attributed_at")?,
                order_index: row.try_get("order_index")?,
            });
        }
        Ok(out)
    }

    async fn votes(&self, version_id: i64) -> Result<Vec<Vote>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, anon_key, direction, cast_at
              FROM vote WHERE page_version_id = $1 ORDER BY cast_at, id
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let user_id: Option<i64> = row.try_get("user_id")?;
            let anon_key: Option<String> = row.try_get("anon_key")?;
            let voter = match (user_id, anon_key) {
                (Some(id), _) => Voter::User(id),
                (None, Some(key)) => Voter::Anonymous(key),
                (None, None) => {
                    return Err(StoreError::Codec(format!(
                        "vote on version {version_id} has no voter"
                    )))
                }
            };
            out.push(Vote {
                voter,
                direction: row.try_get("direction")?,
                cast_at: row.try_get("cast_at")?,
            });
        }
        Ok(out)
    }

    async fn revisions(&self, version_id: i64) -> Result<Vec<Revision>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT upstream_revision_id, revision_number, user_id, created_at, change_type, comment
              FROM revision WHERE page_version_id = $1 ORDER BY revision_number, id
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Revision {
                upstream_revision_id: row.try_get("upstream_revision_id")?,
                revision_number: row.try_get("revision_number")?,
                user_id: row.try_get("user_id")?,
                created_at: row.try_get("created_at")?,
                change_type: row.try_get("change_type")?,
                comment: row.try_get("comment")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl DirtyQueueRepo for PgStore {
    async fn mark_dirty(
        &self,
        page_id: i64,
        mark: &DirtyMark,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut reasons: Vec<String> = Vec::with_capacity(mark.reasons.len());
        for reason in &mark.reasons {
            let reason = reason.as_str().to_string();
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
        }
        sqlx::query(
            r#"
            INSERT INTO dirty_page
                (page_id, need_phase_b, need_phase_c, done_phase_b, done_phase_c,
                 reasons, estimated_cost, created_at, updated_at)
            VALUES ($1, $2, $3, FALSE, FALSE, $4, COALESCE($5, 0), $6, $6)
            ON CONFLICT (page_id) DO UPDATE SET
                need_phase_b = dirty_page.need_phase_b OR EXCLUDED.need_phase_b,
                need_phase_c = dirty_page.need_phase_c OR EXCLUDED.need_phase_c,
                done_phase_b = dirty_page.done_phase_b AND NOT EXCLUDED.need_phase_b,
                done_phase_c = dirty_page.done_phase_c AND NOT EXCLUDED.need_phase_c,
                reasons = dirty_page.reasons || ARRAY(
                    SELECT r FROM unnest(EXCLUDED.reasons) AS r
                     WHERE NOT (r = ANY(dirty_page.reasons))
                ),
                estimated_cost = COALESCE($5, dirty_page.estimated_cost),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(page_id)
        .bind(mark.need_phase_b)
        .bind(mark.need_phase_c)
        .bind(reasons)
        .bind(mark.estimated_cost.map(as_i32))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dirty_page(&self, page_id: i64) -> Result<Option<DirtyPage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DIRTY_COLUMNS} FROM dirty_page WHERE page_id = $1"
        ))
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(dirty_from_row).transpose()
    }

    async fn pending(
        &self,
        phase: Phase,
        limit: Option<usize>,
    ) -> Result<Vec<DirtyPage>, StoreError> {
        let predicate = match phase {
            Phase::B => "need_phase_b AND NOT done_phase_b",
            Phase::C => "need_phase_c AND NOT done_phase_c",
            Phase::A => return Ok(Vec::new()),
        };
        let rows = sqlx::query(&format!(
            "SELECT {DIRTY_COLUMNS} FROM dirty_page WHERE {predicate} \
             ORDER BY estimated_cost, page_id LIMIT $1"
        ))
        .bind(limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dirty_from_row).collect()
    }

    async fn claim(
        &self,
        page_id: i64,
        phase: Phase,
        lease: Lease,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let sql = match phase {
            Phase::B => CLAIM_B,
            Phase::C => CLAIM_C,
            Phase::A => return Err(unsupported_phase(phase)),
        };
        let result = sqlx::query(sql)
            .bind(page_id)
            .bind(lease.owner)
            .bind(lease.claimed_at)
            .bind(lease.claimed_at - ttl)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_phase_b(
        &self,
        page_id: i64,
        owner: Uuid,
        deep: DeepIntent,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let deep = match deep {
            DeepIntent::Keep => "keep",
            DeepIntent::Require => "require",
            DeepIntent::Clear => "clear",
        };
        let result = sqlx::query(
            r#"
            UPDATE dirty_page
               SET done_phase_b = TRUE, need_phase_b = FALSE,
                   lease_b_owner = NULL, lease_b_at = NULL,
                   last_error = NULL, completed_b_at = $3, updated_at = $3,
                   need_phase_c = CASE $4::text WHEN 'require' THEN TRUE
                                                WHEN 'clear' THEN FALSE
                                                ELSE need_phase_c END,
                   done_phase_c = CASE $4::text WHEN 'require' THEN FALSE
                                                ELSE done_phase_c END
             WHERE page_id = $1 AND lease_b_owner = $2
            "#,
        )
        .bind(page_id)
        .bind(owner)
        .bind(now)
        .bind(deep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_phase_c(
        &self,
        page_id: i64,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dirty_page
               SET done_phase_c = TRUE, need_phase_c = FALSE,
                   lease_c_owner = NULL, lease_c_at = NULL,
                   last_error = NULL, completed_c_at = $3, updated_at = $3
             WHERE page_id = $1 AND lease_c_owner = $2
            "#,
        )
        .bind(page_id)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        page_id: i64,
        phase: Phase,
        owner: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let sql = match phase {
            Phase::B => FAIL_B,
            Phase::C => FAIL_C,
            Phase::A => return Err(unsupported_phase(phase)),
        };
        let result = sqlx::query(sql)
            .bind(page_id)
            .bind(owner)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, page_id: i64, phase: Phase, owner: Uuid) -> Result<bool, StoreError> {
        let sql = match phase {
            Phase::B => RELEASE_B,
            Phase::C => RELEASE_C,
            Phase::A => return Err(unsupported_phase(phase)),
        };
        let result = sqlx::query(sql)
            .bind(page_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn queue_summary(&self) -> Result<QueueSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE need_phase_b AND NOT done_phase_b) AS pending_b,
                   COUNT(*) FILTER (WHERE need_phase_c AND NOT done_phase_c) AS pending_c,
                   COUNT(*) FILTER (WHERE lease_b_owner IS NOT NULL) AS leased_b,
                   COUNT(*) FILTER (WHERE lease_c_owner IS NOT NULL) AS leased_c,
                   COUNT(*) FILTER (WHERE last_error IS NOT NULL) AS with_errors
              FROM dirty_page
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let count = |name: &str| -> Result<usize, StoreError> {
            let n: i64 = row.try_get(name)?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(QueueSummary {
            total: count("total")?,
            pending_b: count("pending_b")?,
            pending_c: count("pending_c")?,
            leased_b: count("leased_b")?,
            leased_c: count("leased_c")?,
            with_errors: count("with_errors")?,
        })
    }
}
