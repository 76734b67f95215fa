//! Point-cost estimation over a pluggable per-field weight table.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

/// A list-valued field whose cost grows with the number of nodes returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connection {
    Attributions,
    Votes,
    Revisions,
}

impl Connection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connection::Attributions => "attributions",
            Connection::Votes => "votes",
            Connection::Revisions => "revisions",
        }
    }
}

/// One GraphQL selection we know how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryShape {
    Catalog,
    Detail,
    DeepContent,
    DeepVotes,
    DeepRevisions,
}

const CATALOG_FIELDS: &[&str] = &[
    "url",
    "upstreamId",
    "title",
    "rating",
    "voteCount",
    "revisionCount",
    "tags",
    "isDeleted",
];
const DETAIL_FIELDS: &[&str] = &[
    "upstreamId",
    "title",
    "rating",
    "voteCount",
    "revisionCount",
    "tags",
    "isDeleted",
];
const CONTENT_FIELDS: &[&str] = &["source", "textContent"];

impl QueryShape {
    pub const ALL: [QueryShape; 5] = [
        QueryShape::Catalog,
        QueryShape::Detail,
        QueryShape::DeepContent,
        QueryShape::DeepVotes,
        QueryShape::DeepRevisions,
    ];

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            QueryShape::Catalog => CATALOG_FIELDS,
            QueryShape::Detail => DETAIL_FIELDS,
            QueryShape::DeepContent => CONTENT_FIELDS,
            QueryShape::DeepVotes | QueryShape::DeepRevisions => &[],
        }
    }

    pub fn connections(&self) -> &'static [Connection] {
        match self {
            QueryShape::Catalog | QueryShape::Detail => &[],
            QueryShape::DeepContent => &[Connection::Attributions],
            QueryShape::DeepVotes => &[Connection::Votes],
            QueryShape::DeepRevisions => &[Connection::Revisions],
        }
    }

    /// Selection set requested for every page of this shape.
    pub fn selection(&self) -> &'static str {
        match self {
            QueryShape::Catalog => {
                "url upstreamId title rating voteCount revisionCount tags isDeleted"
            }
            QueryShape::Detail => "upstreamId title rating voteCount revisionCount tags isDeleted",
            QueryShape::DeepContent => {
                "source textContent attributions { userId userName type date order }"
            }
            QueryShape::DeepVotes => "votes { userId anonKey direction castAt }",
            QueryShape::DeepRevisions => {
                "revisions { id number userId createdAt type comment }"
            }
        }
    }

    pub fn operation_name(&self) -> &'static str {
        match self {
            QueryShape::Catalog => "CatalogPage",
            QueryShape::Detail => "PageDetails",
            QueryShape::DeepContent => "PageContent",
            QueryShape::DeepVotes => "PageVotes",
            QueryShape::DeepRevisions => "PageRevisions",
        }
    }
}

/// What one page costs to hydrate: the cheap detail shape, or every deep sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchShape {
    Detail,
    Deep,
}

impl FetchShape {
    pub fn parts(&self) -> &'static [QueryShape] {
        match self {
            FetchShape::Detail => &[QueryShape::Detail],
            FetchShape::Deep => &[
                QueryShape::DeepContent,
                QueryShape::DeepVotes,
                QueryShape::DeepRevisions,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionWeight {
    /// Paid once per connection requested.
    pub per_connection: u32,
    pub per_node: u32,
    /// Node count assumed when the page carries no count hint.
    pub expected_nodes: u32,
}

/// Upstream-specific weights. Loaded from the tuning file, never hard-coded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostTable {
    pub request_base: u32,
    pub fields: BTreeMap<String, u32>,
    pub connections: BTreeMap<String, ConnectionWeight>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CostError {
    #[error("cost table has no weight for field `{0}`")]
    MissingField(String),
    #[error("cost table has no weight for connection `{0}`")]
    MissingConnection(String),
}

impl CostTable {
    /// Every field and connection of every known shape must carry a weight.
    pub fn validate(&self) -> Result<(), CostError> {
        for shape in QueryShape::ALL {
            for field in shape.fields() {
                if !self.fields.contains_key(*field) {
                    return Err(CostError::MissingField(field.to_string()));
                }
            }
            for conn in shape.connections() {
                if !self.connections.contains_key(conn.as_str()) {
                    return Err(CostError::MissingConnection(conn.as_str().to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Per-page size hints taken from the last known counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CostHints {
    pub vote_count: Option<i64>,
    pub revision_count: Option<i64>,
}

impl CostHints {
    fn nodes(&self, conn: Connection) -> Option<u32> {
        let count = match conn {
            Connection::Votes => self.vote_count,
            Connection::Revisions => self.revision_count,
            Connection::Attributions => None,
        }?;
        Some(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone)]
pub struct CostEstimator {
    table: CostTable,
}

impl CostEstimator {
    pub fn new(table: CostTable) -> Result<Self, CostError> {
        table.validate()?;
        Ok(Self { table })
    }

    pub fn request_base(&self) -> u32 {
        self.table.request_base
    }

    /// Points one page adds to a request of `shape`.
    pub fn item_cost(&self, shape: QueryShape, hints: &CostHints) -> u32 {
        let mut cost = 0u32;
        for field in shape.fields() {
            cost = cost.saturating_add(self.table.fields.get(*field).copied().unwrap_or(0));
        }
        for conn in shape.connections() {
            if let Some(weight) = self.table.connections.get(conn.as_str()) {
                let nodes = hints.nodes(*conn).unwrap_or(weight.expected_nodes);
                cost = cost
                    .saturating_add(weight.per_connection)
                    .saturating_add(weight.per_node.saturating_mul(nodes));
            }
        }
        cost
    }

    /// Points one page adds across every sub-request of `shape`.
    pub fn fetch_cost(&self, shape: FetchShape, hints: &CostHints) -> u32 {
        shape
            .parts()
            .iter()
            .fold(0u32, |acc, part| acc.saturating_add(self.item_cost(*part, hints)))
    }

    /// Estimated deep-hydration cost of a page, recorded on staging and dirty rows.
    pub fn deep_cost(&self, hints: &CostHints) -> u32 {
        self.fetch_cost(FetchShape::Deep, hints)
    }

    pub fn request_cost<'a>(
        &self,
        shape: QueryShape,
        hints: impl IntoIterator<Item = &'a CostHints>,
    ) -> u32 {
        hints.into_iter().fold(self.table.request_base, |acc, h| {
            acc.saturating_add(self.item_cost(shape, h))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TABLE_YAML: &str = r#"
request_base: 1
fields:
  url: 0
  upstreamId: 0
  title: 1
  rating: 1
  voteCount: 1
  revisionCount: 1
  tags: 2
  isDeleted: 0
  source: 10
  textContent: 10
connections:
  attributions: { per_connection: 1, per_node: 1, expected_nodes: 2 }
  votes: { per_connection: 2, per_node: 1, expected_nodes: 20 }
  revisions: { per_connection: 2, per_node: 2, expected_nodes: 10 }
"#;

    pub(crate) fn estimator() -> CostEstimator {
        let table: CostTable = serde_yaml::from_str(TABLE_YAML).expect("table");
        CostEstimator::new(table).expect("valid table")
    }

    #[test]
    fn detail_cost_sums_field_weights() {
        let est = estimator();
        assert_eq!(est.item_cost(QueryShape::Detail, &CostHints::default()), 6);
        assert_eq!(
            est.request_cost(QueryShape::Detail, &[CostHints::default(), CostHints::default()]),
            13
        );
    }

    #[test]
    fn connection_cost_follows_count_hints() {
        let est = estimator();
        let small = CostHints {
            vote_count: Some(3),
            revision_count: Some(1),
        };
        // content 20 + attributions 1+2, votes 2+3, revisions 2+2
        assert_eq!(est.deep_cost(&small), 32);

        let unknown = CostHints::default();
        // content 23, votes 2+20, revisions 2+20
        assert_eq!(est.deep_cost(&unknown), 67);
    }

    #[test]
    fn incomplete_table_is_rejected() {
        let mut table: CostTable = serde_yaml::from_str(TABLE_YAML).expect("table");
        table.fields.remove("tags");
        assert_eq!(
            CostEstimator::new(table).unwrap_err(),
            CostError::MissingField("tags".into())
        );
    }
}
