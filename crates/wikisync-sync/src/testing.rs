//! In-process stand-in for the upstream GraphQL catalog, used by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use wikisync_core::{Attribution, Revision, Vote, Voter};
use wikisync_upstream::{GraphQlRequest, GraphQlResponse, GraphQlTransport, UpstreamError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakePage {
    pub upstream_id: i64,
    pub title: String,
    pub rating: i64,
    pub vote_count: i64,
    pub revision_count: i64,
    pub tags: Vec<String>,
    pub is_deleted: bool,
    pub source: String,
    pub text_content: String,
    pub attributions: Vec<Attribution>,
    pub votes: Vec<Vote>,
    pub revisions: Vec<Revision>,
}

impl FakePage {
    fn detail_json(&self, url: Option<&str>) -> Value {
        let mut node = json!({
            "upstreamId": self.upstream_id.to_string(),
            "title": self.title,
            "rating": self.rating,
            "voteCount": self.vote_count,
            "revisionCount": self.revision_count,
            "tags": self.tags,
            "isDeleted": self.is_deleted,
        });
        if let (Some(url), Some(obj)) = (url, node.as_object_mut()) {
            obj.insert("url".into(), json!(url));
        }
        node
    }

    fn content_json(&self) -> Value {
        json!({
            "source": self.source,
            "textContent": self.text_content,
            "attributions": self.attributions.iter().map(|a| json!({
                "userId": a.user_id,
                "userName": a.user_name,
                "type": a.attribution_type,
                "date": a.attributed_at.map(|d| d.to_rfc3339()),
                "order": a.order_index,
            })).collect::<Vec<_>>(),
        })
    }

    fn votes_json(&self) -> Value {
        json!({
            "votes": self.votes.iter().map(|v| {
                let (user_id, anon_key) = match &v.voter {
                    Voter::User(id) => (Some(*id), None),
                    Voter::Anonymous(key) => (None, Some(key.clone())),
                };
                json!({
                    "userId": user_id,
                    "anonKey": anon_key,
                    "direction": v.direction,
                    "castAt": v.cast_at.to_rfc3339(),
                })
            }).collect::<Vec<_>>(),
        })
    }

    fn revisions_json(&self) -> Value {
        json!({
            "revisions": self.revisions.iter().map(|r| json!({
                "id": r.upstream_revision_id,
                "number": r.revision_number,
                "userId": r.user_id,
                "createdAt": r.created_at.to_rfc3339(),
                "type": r.change_type,
                "comment": r.comment,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug)]
struct Failure {
    url: Option<String>,
    operation: Option<String>,
    error: UpstreamError,
    /// Emitted as a GraphQL error scoped to the page's alias instead of failing the request.
    alias_scoped: bool,
    remaining: usize,
}

#[derive(Debug, Default)]
struct State {
    pages: BTreeMap<String, FakePage>,
    failures: Vec<Failure>,
    calls_by_url: HashMap<String, usize>,
    calls_by_operation: HashMap<String, usize>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Scripted upstream: serves pages from memory and injects failures on request.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

fn error_code(error: &UpstreamError) -> &'static str {
    match error {
        UpstreamError::RateLimited { .. } => "RATE_LIMITED",
        UpstreamError::Transient(_) => "INTERNAL_SERVER_ERROR",
        UpstreamError::Permanent(_) => "BAD_USER_INPUT",
    }
}

impl ScriptedTransport {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn upsert_page(&self, url: &str, page: FakePage) {
        self.state().pages.insert(url.to_string(), page);
    }

    pub fn update_page(&self, url: &str, edit: impl FnOnce(&mut FakePage)) {
        if let Some(page) = self.state().pages.get_mut(url) {
            edit(page);
        }
    }

    /// Move a page to a new URL, keeping its upstream identity.
    pub fn rename_page(&self, from: &str, to: &str) {
        let mut state = self.state();
        if let Some(page) = state.pages.remove(from) {
            state.pages.insert(to.to_string(), page);
        }
    }

    pub fn remove_page(&self, url: &str) {
        self.state().pages.remove(url);
    }

    /// Fail the next `times` requests that mention `url`.
    pub fn fail_url(&self, url: &str, error: UpstreamError, times: usize) {
        self.push_failure(Some(url), None, error, false, times);
    }

    /// Fail the next `times` requests of `operation` that mention `url`.
    pub fn fail_operation(&self, url: &str, operation: &str, error: UpstreamError, times: usize) {
        self.push_failure(Some(url), Some(operation), error, false, times);
    }

    /// Fail every request of `operation`, whatever it mentions.
    pub fn fail_any(&self, operation: &str, error: UpstreamError, times: usize) {
        self.push_failure(None, Some(operation), error, false, times);
    }

    /// Answer `url` with a GraphQL error on its alias while the rest of the batch succeeds.
    pub fn fail_alias(&self, url: &str, error: UpstreamError, times: usize) {
        self.push_failure(Some(url), None, error, true, times);
    }

    fn push_failure(
        &self,
        url: Option<&str>,
        operation: Option<&str>,
        error: UpstreamError,
        alias_scoped: bool,
        times: usize,
    ) {
        self.state().failures.push(Failure {
            url: url.map(str::to_string),
            operation: operation.map(str::to_string),
            error,
            alias_scoped,
            remaining: times,
        });
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = Some(latency);
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.state().calls_by_url.get(url).copied().unwrap_or(0)
    }

    pub fn operation_calls(&self, operation: &str) -> usize {
        self.state()
            .calls_by_operation
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls_by_operation.values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    fn answer(&self, request: &GraphQlRequest) -> Result<GraphQlResponse, UpstreamError> {
        let mut state = self.state();
        let op = request.operation_name.as_str();
        *state.calls_by_operation.entry(op.to_string()).or_default() += 1;

        if op == "CatalogPage" {
            if let Some(err) = take_failure(&mut state, op, &[], false) {
                return Err(err);
            }
            return Ok(catalog_page(&state, &request.variables));
        }

        // aliased page batch: $u0.. map onto p0..
        let mut urls = Vec::new();
        let mut index = 0usize;
        while let Some(Value::String(url)) = request.variables.get(&format!("u{index}")) {
            urls.push(url.clone());
            index += 1;
        }
        for url in &urls {
            *state.calls_by_url.entry(url.clone()).or_default() += 1;
        }
        if let Some(err) = take_failure(&mut state, op, &urls, false) {
            return Err(err);
        }

        let mut data = Map::new();
        let mut errors = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            let alias = format!("p{i}");
            if let Some(err) = take_failure(&mut state, op, std::slice::from_ref(url), true) {
                data.insert(alias.clone(), Value::Null);
                errors.push(json!({
                    "message": err.to_string(),
                    "path": [alias],
                    "extensions": {"code": error_code(&err)},
                }));
                continue;
            }
            let value = match state.pages.get(url) {
                None => Value::Null,
                Some(page) => match op {
                    "PageDetails" => page.detail_json(None),
                    "PageContent" => page.content_json(),
                    "PageVotes" => page.votes_json(),
                    "PageRevisions" => page.revisions_json(),
                    other => {
                        return Err(UpstreamError::Permanent(format!(
                            "unknown operation {other}"
                        )))
                    }
                },
            };
            data.insert(alias, value);
        }
        let body = json!({"data": data, "errors": errors});
        serde_json::from_value(body).map_err(|e| UpstreamError::Permanent(e.to_string()))
    }
}

fn take_failure(
    state: &mut State,
    operation: &str,
    urls: &[String],
    alias_scoped: bool,
) -> Option<UpstreamError> {
    let failure = state.failures.iter_mut().find(|f| {
        f.remaining > 0
            && f.alias_scoped == alias_scoped
            && f.operation.as_deref().map_or(true, |op| op == operation)
            && f.url.as_ref().map_or(true, |u| urls.contains(u))
    })?;
    failure.remaining -= 1;
    Some(failure.error.clone())
}

fn catalog_page(state: &State, variables: &Map<String, Value>) -> GraphQlResponse {
    let first = variables
        .get("first")
        .and_then(Value::as_u64)
        .unwrap_or(1)
        .max(1) as usize;
    let offset = variables
        .get("after")
        .and_then(Value::as_str)
        .and_then(|c| c.strip_prefix('c'))
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(0);

    let edges = state
        .pages
        .iter()
        .skip(offset)
        .take(first)
        .enumerate()
        .map(|(i, (url, page))| {
            json!({"cursor": format!("c{}", offset + i + 1), "node": page.detail_json(Some(url))})
        })
        .collect::<Vec<_>>();
    let end = offset + edges.len();
    let body = json!({
        "data": {"pages": {
            "edges": edges,
            "pageInfo": {
                "hasNextPage": end < state.pages.len(),
                "endCursor": if edges.is_empty() { Value::Null } else { json!(format!("c{end}")) },
            }
        }}
    });
    serde_json::from_value(body).unwrap_or_default()
}

#[async_trait]
impl GraphQlTransport for ScriptedTransport {
    async fn execute(&self, request: &GraphQlRequest) -> Result<GraphQlResponse, UpstreamError> {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let result = self.answer(request);
        self.state().in_flight -= 1;
        result
    }
}
