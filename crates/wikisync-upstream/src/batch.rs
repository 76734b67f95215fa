//! Greedy packing of page requests into aliased GraphQL documents.

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cost::{CostEstimator, CostHints, FetchShape, QueryShape};
use crate::{GraphQlRequest, GraphQlResponse, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchLimits {
    /// Per-request point budget a batch is packed up to.
    pub bucket_soft_limit: u32,
    /// Hard cap on pages per request.
    pub max_first: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub page_id: i64,
    pub url: String,
    pub hints: CostHints,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubRequest {
    pub part: QueryShape,
    pub cost: u32,
    pub request: GraphQlRequest,
}

/// One scheduled unit of upstream work. Deep batches carry one sub-request per deep part.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBatch {
    pub shape: FetchShape,
    pub items: Vec<BatchItem>,
    pub cost: u32,
    pub requests: Vec<SubRequest>,
}

/// A single item's slice of a batch: one value per sub-request, or the error scoped to its alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub item: BatchItem,
    pub result: Result<Vec<Value>, UpstreamError>,
}

pub fn alias(index: usize) -> String {
    format!("p{index}")
}

impl QueryBatch {
    pub fn page_ids(&self) -> Vec<i64> {
        self.items.iter().map(|i| i.page_id).collect()
    }

    /// Distribute `responses` (ordered like `self.requests`) over the items.
    pub fn split(&self, responses: &[GraphQlResponse]) -> Vec<ItemOutcome> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let alias = alias(index);
                let mut values = Vec::with_capacity(responses.len());
                let mut failure = None;
                for response in responses {
                    if let Some(err) = response.alias_error(&alias) {
                        failure = Some(err.classify());
                        break;
                    }
                    values.push(response.field(&alias).clone());
                }
                ItemOutcome {
                    item: item.clone(),
                    result: match failure {
                        Some(err) => Err(err),
                        None => Ok(values),
                    },
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BatchBuilder {
    estimator: CostEstimator,
    limits: BatchLimits,
}

impl BatchBuilder {
    pub fn new(estimator: CostEstimator, limits: BatchLimits) -> Self {
        Self { estimator, limits }
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Catalog page size: `max_first`, shrunk so one page request stays inside the soft budget.
    pub fn catalog_page_size(&self) -> usize {
        let per_item = self
            .estimator
            .item_cost(QueryShape::Catalog, &CostHints::default())
            .max(1);
        let room = self
            .limits
            .bucket_soft_limit
            .saturating_sub(self.estimator.request_base());
        let fits = usize::try_from(room / per_item).unwrap_or(usize::MAX);
        fits.clamp(1, self.limits.max_first.max(1))
    }

    /// Pack `items` in order. Each item lands in exactly one batch; an item over budget on its
    /// own still gets a batch of one.
    pub fn build(&self, shape: FetchShape, items: Vec<BatchItem>) -> Vec<QueryBatch> {
        let max_items = self.limits.max_first.max(1);
        let base = self
            .estimator
            .request_base()
            .saturating_mul(shape.parts().len() as u32);

        let mut batches = Vec::new();
        let mut current: Vec<BatchItem> = Vec::new();
        let mut current_cost = base;

        for item in items {
            let cost = self.estimator.fetch_cost(shape, &item.hints);
            let full = current.len() >= max_items
                || current_cost.saturating_add(cost) > self.limits.bucket_soft_limit;
            if !current.is_empty() && full {
                batches.push(self.finish(shape, std::mem::take(&mut current)));
                current_cost = base;
            }
            current_cost = current_cost.saturating_add(cost);
            current.push(item);
        }
        if !current.is_empty() {
            batches.push(self.finish(shape, current));
        }
        batches
    }

    fn finish(&self, shape: FetchShape, items: Vec<BatchItem>) -> QueryBatch {
        let requests = shape
            .parts()
            .iter()
            .map(|part| SubRequest {
                part: *part,
                cost: self
                    .estimator
                    .request_cost(*part, items.iter().map(|i| &i.hints)),
                request: render(*part, &items),
            })
            .collect::<Vec<_>>();
        let cost = requests
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.cost));
        QueryBatch {
            shape,
            items,
            cost,
            requests,
        }
    }
}

fn render(part: QueryShape, items: &[BatchItem]) -> GraphQlRequest {
    let mut params = Vec::with_capacity(items.len());
    let mut body = String::new();
    let mut variables = Map::new();
    for (index, item) in items.iter().enumerate() {
        params.push(format!("$u{index}: String!"));
        let _ = writeln!(
            body,
            "  {}: page(url: $u{index}) {{ {} }}",
            alias(index),
            part.selection()
        );
        variables.insert(format!("u{index}"), Value::String(item.url.clone()));
    }
    GraphQlRequest {
        operation_name: part.operation_name().to_string(),
        query: format!(
            "query {}({}) {{\n{}}}",
            part.operation_name(),
            params.join(", "),
            body
        ),
        variables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::tests::estimator;
    use serde_json::json;
    use std::collections::HashSet;

    fn item(page_id: i64, votes: i64) -> BatchItem {
        BatchItem {
            page_id,
            url: format!("page-{page_id}"),
            hints: CostHints {
                vote_count: Some(votes),
                revision_count: Some(1),
            },
        }
    }

    fn builder(soft: u32, max_first: usize) -> BatchBuilder {
        BatchBuilder::new(
            estimator(),
            BatchLimits {
                bucket_soft_limit: soft,
                max_first,
            },
        )
    }

    #[test]
    fn every_item_lands_in_exactly_one_batch() {
        let items = (1..=23).map(|id| item(id, id * 3)).collect::<Vec<_>>();
        let batches = builder(150, 5).build(FetchShape::Deep, items);

        let mut seen = HashSet::new();
        let mut total = 0;
        for batch in &batches {
            assert!(batch.items.len() <= 5);
            assert_eq!(batch.requests.len(), 3);
            for item in &batch.items {
                assert!(seen.insert(item.page_id), "duplicate {}", item.page_id);
                total += 1;
            }
        }
        assert_eq!(total, 23);
        assert_eq!(seen.len(), 23);
    }

    #[test]
    fn detail_batches_respect_the_soft_budget() {
        // detail item cost 6, base 1: at most 4 items under 25 points
        let items = (1..=10).map(|id| item(id, 0)).collect::<Vec<_>>();
        let batches = builder(25, 100).build(FetchShape::Detail, items);
        assert_eq!(
            batches.iter().map(|b| b.items.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert!(batches.iter().all(|b| b.cost <= 25));
    }

    #[test]
    fn oversized_item_gets_its_own_batch() {
        let items = vec![item(1, 0), item(2, 10_000), item(3, 0)];
        let batches = builder(120, 10).build(FetchShape::Deep, items);
        assert_eq!(
            batches.iter().map(|b| b.page_ids()).collect::<Vec<_>>(),
            vec![vec![1], vec![2], vec![3]]
        );
    }

    #[test]
    fn documents_alias_each_page_with_its_own_variable() {
        let batches = builder(1_000, 10).build(FetchShape::Detail, vec![item(7, 0), item(9, 0)]);
        let request = &batches[0].requests[0].request;
        assert_eq!(request.operation_name, "PageDetails");
        assert!(request.query.starts_with("query PageDetails($u0: String!, $u1: String!)"));
        assert!(request.query.contains("p0: page(url: $u0) {"));
        assert!(request.query.contains("p1: page(url: $u1) {"));
        assert_eq!(request.variables["u1"], json!("page-9"));
    }

    #[test]
    fn catalog_page_size_is_capped_by_budget_and_max_first() {
        // catalog item cost 6, base 1
        assert_eq!(builder(61, 50).catalog_page_size(), 10);
        assert_eq!(builder(10_000, 50).catalog_page_size(), 50);
        assert_eq!(builder(2, 50).catalog_page_size(), 1);
    }

    #[test]
    fn split_scopes_alias_errors_to_their_item() {
        let batch = builder(1_000, 10)
            .build(FetchShape::Detail, vec![item(1, 0), item(2, 0)])
            .remove(0);
        let response: GraphQlResponse = serde_json::from_value(json!({
            "data": {"p0": {"upstreamId": 1}, "p1": null},
            "errors": [{"message": "bad", "path": ["p1"], "extensions": {"code": "FORBIDDEN"}}]
        }))
        .expect("response");

        let outcomes = batch.split(&[response]);
        assert_eq!(outcomes[0].result.as_ref().expect("ok")[0]["upstreamId"], 1);
        assert!(matches!(
            outcomes[1].result,
            Err(UpstreamError::Permanent(_))
        ));
    }
}
