//! Decoding of catalog, detail and deep responses into domain records.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use wikisync_core::{Attribution, DeepContent, PageMetaStaging, PageState, Revision, Vote, Voter};

use crate::cost::{CostHints, QueryShape};
use crate::{GraphQlRequest, GraphQlResponse, UpstreamError};

/// Upstream ids arrive as GraphQL `ID` (string) on some deployments and as integers on others.
fn de_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "de_id")] i64);
    Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|w| w.0))
}

fn decode<T: DeserializeOwned>(what: &str, value: &Value) -> Result<T, UpstreamError> {
    T::deserialize(value)
        .map_err(|err| UpstreamError::Permanent(format!("unexpected {what} shape: {err}")))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageNode {
    #[serde(default)]
    url: Option<String>,
    #[serde(deserialize_with = "de_id")]
    upstream_id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    rating: Option<i64>,
    #[serde(default)]
    vote_count: Option<i64>,
    #[serde(default)]
    revision_count: Option<i64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    is_deleted: bool,
}

impl PageNode {
    fn state(&self) -> PageState {
        PageState {
            title: self.title.clone(),
            rating: self.rating,
            vote_count: self.vote_count,
            revision_count: self.revision_count,
            tags: self.tags.iter().flatten().cloned().collect(),
            is_deleted: self.is_deleted,
            source: None,
            text_content: None,
        }
    }
}

/// One page as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub url: String,
    pub upstream_id: i64,
    pub state: PageState,
}

impl CatalogNode {
    pub fn hints(&self) -> CostHints {
        CostHints {
            vote_count: self.state.vote_count,
            revision_count: self.state.revision_count,
        }
    }

    pub fn to_staging(&self, estimated_cost: u32, seen_at: DateTime<Utc>) -> PageMetaStaging {
        PageMetaStaging {
            url: self.url.clone(),
            upstream_id: self.upstream_id,
            title: self.state.title.clone(),
            rating: self.state.rating,
            vote_count: self.state.vote_count,
            revision_count: self.state.revision_count,
            tags: self.state.tags.clone(),
            is_deleted: self.state.is_deleted,
            estimated_cost,
            last_seen_at: seen_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPage {
    pub nodes: Vec<CatalogNode>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

pub fn catalog_request(first: usize, after: Option<&str>) -> GraphQlRequest {
    let shape = QueryShape::Catalog;
    let mut variables = Map::new();
    variables.insert("first".into(), json!(first));
    variables.insert("after".into(), after.map_or(Value::Null, |a| json!(a)));
    GraphQlRequest {
        operation_name: shape.operation_name().to_string(),
        query: format!(
            "query {}($first: Int!, $after: String) {{\n  pages(first: $first, after: $after) {{\n    edges {{ cursor node {{ {} }} }}\n    pageInfo {{ hasNextPage endCursor }}\n  }}\n}}",
            shape.operation_name(),
            shape.selection()
        ),
        variables,
    }
}

pub fn parse_catalog(response: &GraphQlResponse) -> Result<CatalogPage, UpstreamError> {
    if let Some(err) = response.errors.first() {
        return Err(err.classify());
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Connection {
        edges: Vec<Edge>,
        page_info: PageInfo,
    }
    #[derive(Deserialize)]
    struct Edge {
        node: Option<PageNode>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct PageInfo {
        has_next_page: bool,
        end_cursor: Option<String>,
    }

    let conn: Connection = decode("catalog", response.field("pages"))?;
    let mut nodes = Vec::with_capacity(conn.edges.len());
    for node in conn.edges.into_iter().filter_map(|e| e.node) {
        let Some(url) = node.url.clone() else {
            return Err(UpstreamError::Permanent(format!(
                "catalog node {} has no url",
                node.upstream_id
            )));
        };
        nodes.push(CatalogNode {
            url,
            upstream_id: node.upstream_id,
            state: node.state(),
        });
    }
    Ok(CatalogPage {
        nodes,
        end_cursor: conn.page_info.end_cursor,
        has_next_page: conn.page_info.has_next_page,
    })
}

/// Detail-shape answer for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRecord {
    pub upstream_id: i64,
    pub state: PageState,
}

/// `None` when the upstream answered `null`, i.e. the page no longer exists.
pub fn parse_detail(value: &Value) -> Result<Option<DetailRecord>, UpstreamError> {
    if value.is_null() {
        return Ok(None);
    }
    let node: PageNode = decode("page detail", value)?;
    Ok(Some(DetailRecord {
        upstream_id: node.upstream_id,
        state: node.state(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentNode {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    text_content: Option<String>,
    #[serde(default)]
    attributions: Vec<AttributionNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributionNode {
    #[serde(default, deserialize_with = "de_opt_id")]
    user_id: Option<i64>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    order: i32,
}

#[derive(Deserialize)]
struct VotesNode {
    #[serde(default)]
    votes: Vec<VoteNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteNode {
    #[serde(default, deserialize_with = "de_opt_id")]
    user_id: Option<i64>,
    #[serde(default)]
    anon_key: Option<String>,
    direction: i32,
    cast_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RevisionsNode {
    #[serde(default)]
    revisions: Vec<RevisionNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionNode {
    #[serde(deserialize_with = "de_id")]
    id: i64,
    number: i32,
    #[serde(default, deserialize_with = "de_opt_id")]
    user_id: Option<i64>,
    created_at: DateTime<Utc>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

/// Assemble deep content from the content, votes and revisions answers (in that order).
/// `None` when any part reports the page gone.
pub fn parse_deep(values: &[Value]) -> Result<Option<DeepContent>, UpstreamError> {
    let [content, votes, revisions] = values else {
        return Err(UpstreamError::Permanent(format!(
            "deep hydration expects 3 sub-responses, got {}",
            values.len()
        )));
    };
    if content.is_null() || votes.is_null() || revisions.is_null() {
        return Ok(None);
    }

    let content: ContentNode = decode("page content", content)?;
    let votes: VotesNode = decode("vote list", votes)?;
    let revisions: RevisionsNode = decode("revision list", revisions)?;

    let mut out = DeepContent {
        source: content.source,
        text_content: content.text_content,
        ..Default::default()
    };
    out.attributions = content
        .attributions
        .into_iter()
        .map(|a| Attribution {
            user_id: a.user_id,
            user_name: a.user_name,
            attribution_type: a.kind,
            attributed_at: a.date,
            order_index: a.order,
        })
        .collect();
    for vote in votes.votes {
        let voter = match (vote.user_id, vote.anon_key) {
            (Some(id), _) => Voter::User(id),
            (None, Some(key)) => Voter::Anonymous(key),
            (None, None) => {
                return Err(UpstreamError::Permanent(
                    "vote carries neither user id nor anonymous key".into(),
                ))
            }
        };
        out.votes.push(Vote {
            voter,
            direction: vote.direction,
            cast_at: vote.cast_at,
        });
    }
    out.revisions = revisions
        .revisions
        .into_iter()
        .map(|r| Revision {
            upstream_revision_id: r.id,
            revision_number: r.number,
            user_id: r.user_id,
            created_at: r.created_at,
            change_type: r.kind,
            comment: r.comment,
        })
        .collect();
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_page_decodes_nodes_and_cursor() {
        let response: GraphQlResponse = serde_json::from_value(json!({
            "data": {"pages": {
                "edges": [
                    {"cursor": "c1", "node": {"url": "scp-173", "upstreamId": "1956234", "title": "SCP-173",
                      "rating": 120, "voteCount": 140, "revisionCount": 44, "tags": ["scp", "euclid"], "isDeleted": false}},
                    {"cursor": "c2", "node": null}
                ],
                "pageInfo": {"hasNextPage": true, "endCursor": "c2"}
            }}
        }))
        .expect("response");

        let page = parse_catalog(&response).expect("catalog");
        assert_eq!(page.nodes.len(), 1);
        assert_eq!(page.nodes[0].upstream_id, 1956234);
        assert_eq!(page.nodes[0].state.rating, Some(120));
        assert!(page.nodes[0].state.tags.contains("euclid"));
        assert_eq!(page.end_cursor.as_deref(), Some("c2"));
        assert!(page.has_next_page);
    }

    #[test]
    fn catalog_request_carries_cursor_variables() {
        let request = catalog_request(50, Some("abc"));
        assert_eq!(request.variables["first"], json!(50));
        assert_eq!(request.variables["after"], json!("abc"));
        assert!(request.query.contains("pages(first: $first, after: $after)"));
        assert!(catalog_request(50, None).variables["after"].is_null());
    }

    #[test]
    fn null_detail_means_deleted_upstream() {
        assert_eq!(parse_detail(&Value::Null).expect("null"), None);
        let record = parse_detail(&json!({"upstreamId": 5, "rating": 3, "tags": null}))
            .expect("detail")
            .expect("present");
        assert_eq!(record.upstream_id, 5);
        assert!(record.state.tags.is_empty());
    }

    #[test]
    fn detail_shape_drift_is_permanent() {
        let err = parse_detail(&json!({"rating": "lots"})).unwrap_err();
        assert!(matches!(err, UpstreamError::Permanent(_)));
    }

    #[test]
    fn deep_parts_assemble_into_content() {
        let values = vec![
            json!({"source": "body", "textContent": "text", "attributions": [
                {"userId": 9, "userName": "Dr Gears", "type": "author", "order": 0}
            ]}),
            json!({"votes": [
                {"userId": 9, "direction": 1, "castAt": "2026-01-02T03:04:05Z"},
                {"anonKey": "k1", "direction": -1, "castAt": "2026-01-02T03:04:06Z"}
            ]}),
            json!({"revisions": [
                {"id": "77", "number": 0, "userId": 9, "createdAt": "2026-01-01T00:00:00Z", "type": "new"}
            ]}),
        ];
        let deep = parse_deep(&values).expect("deep").expect("present");
        assert_eq!(deep.source.as_deref(), Some("body"));
        assert_eq!(deep.attributions[0].attribution_type, "author");
        assert_eq!(deep.votes[1].voter, Voter::Anonymous("k1".into()));
        assert_eq!(deep.revisions[0].upstream_revision_id, 77);
    }

    #[test]
    fn deep_with_a_vanished_part_reads_as_gone() {
        let values = vec![json!({"source": "x"}), Value::Null, json!({"revisions": []})];
        assert_eq!(parse_deep(&values).expect("deep"), None);
        assert!(parse_deep(&values[..2]).is_err());
    }
}
