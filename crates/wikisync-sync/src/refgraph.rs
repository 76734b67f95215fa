//! Offline reference-graph workers: outgoing link weights from already-committed page source.
//!
//! Callers talk to the pool only through messages. Each request carries a batch of page ids
//! and a reply channel; a worker answers with the flat edge list or an error string, and a
//! panicking computation is reported the same way instead of taking the pool down.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wikisync_storage::{StoreError, VersionRepo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceEdge {
    pub target: String,
    /// Occurrences in the source.
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageEdges {
    pub page_id: i64,
    pub edges: Vec<ReferenceEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefGraphError {
    #[error("reference graph pool is closed")]
    PoolClosed,
    #[error("reference graph worker failed: {0}")]
    Worker(String),
}

/// Read side the workers need: the current source text of a page.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn current_source(&self, page_id: i64) -> Result<Option<String>, StoreError>;
}

#[async_trait]
impl<T> ContentSource for T
where
    T: VersionRepo + ?Sized,
{
    async fn current_source(&self, page_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self
            .current_version(page_id)
            .await?
            .and_then(|v| v.state.source))
    }
}

fn triple_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\[\[([^\[\]|]+?)(?:\|[^\]]*)?\]\]\]").expect("triple link regex")
    })
}

fn include_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[\[include\s+([^\s\]]+)[^\]]*\]\]").expect("include regex"))
}

fn single_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[/([^\s\]]+)(?:\s[^\]]*)?\]").expect("single link regex"))
}

/// Lowercased page path, or `None` for external and empty targets.
fn normalize_target(raw: &str) -> Option<String> {
    let target = raw.trim();
    if target.contains("://") || target.starts_with("//") {
        return None;
    }
    let target = target.split('#').next().unwrap_or("").trim();
    let target = target.trim_start_matches('/').to_lowercase();
    (!target.is_empty()).then_some(target)
}

/// Aggregate outgoing references of one page, sorted by target.
pub fn extract_edges(source: &str) -> Vec<ReferenceEdge> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    let mut add = |raw: &str| {
        if let Some(target) = normalize_target(raw) {
            *counts.entry(target).or_default() += 1;
        }
    };

    for cap in triple_link().captures_iter(source) {
        add(&cap[1]);
    }
    // blank triple links so their inner text is not matched again
    let rest = triple_link().replace_all(source, " ");
    for cap in include_link().captures_iter(&rest) {
        add(&cap[1]);
    }
    for cap in single_link().captures_iter(&rest) {
        add(&cap[1]);
    }

    counts
        .into_iter()
        .map(|(target, weight)| ReferenceEdge { target, weight })
        .collect()
}

struct Task {
    page_ids: Vec<i64>,
    reply: oneshot::Sender<Result<Vec<PageEdges>, RefGraphError>>,
}

/// Fixed-size pool of reference-graph workers sharing one task queue.
pub struct ReferenceGraphPool {
    tx: Option<mpsc::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ReferenceGraphPool {
    pub fn start<S>(source: Arc<S>, workers: usize) -> Self
    where
        S: ContentSource + ?Sized + 'static,
    {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Task>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, rx.clone(), source.clone())))
            .collect();
        Self {
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Edges for every id in `page_ids`, in the same order. Pages without committed source
    /// yield no edges.
    pub async fn compute(&self, page_ids: Vec<i64>) -> Result<Vec<PageEdges>, RefGraphError> {
        let tx = self.tx.as_ref().ok_or(RefGraphError::PoolClosed)?;
        let (reply, answer) = oneshot::channel();
        tx.send(Task { page_ids, reply })
            .await
            .map_err(|_| RefGraphError::PoolClosed)?;
        answer.await.map_err(|_| RefGraphError::PoolClosed)?
    }

    /// Stop accepting work and wait for queued tasks to drain.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                warn!(%err, "reference graph worker ended abnormally");
            }
        }
    }
}

async fn worker_loop<S>(id: usize, rx: Arc<Mutex<mpsc::Receiver<Task>>>, source: Arc<S>)
where
    S: ContentSource + ?Sized + 'static,
{
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            break;
        };
        debug!(worker = id, pages = task.page_ids.len(), "reference graph task");

        let source = source.clone();
        let page_ids = task.page_ids;
        let result = match tokio::spawn(async move { edges_for(source.as_ref(), &page_ids).await })
            .await
        {
            Ok(result) => result,
            Err(err) => Err(RefGraphError::Worker(format!("worker {id}: {err}"))),
        };
        if let Err(err) = &result {
            warn!(worker = id, error = %err, "reference graph task failed");
        }
        // caller may have given up waiting
        let _ = task.reply.send(result);
    }
}

async fn edges_for<S>(source: &S, page_ids: &[i64]) -> Result<Vec<PageEdges>, RefGraphError>
where
    S: ContentSource + ?Sized,
{
    let mut out = Vec::with_capacity(page_ids.len());
    for &page_id in page_ids {
        let text = source
            .current_source(page_id)
            .await
            .map_err(|err| RefGraphError::Worker(format!("reading page {page_id}: {err}")))?;
        let edges = match text {
            None => Vec::new(),
            Some(text) => tokio::task::spawn_blocking(move || extract_edges(&text))
                .await
                .map_err(|err| RefGraphError::Worker(format!("extracting page {page_id}: {err}")))?,
        };
        out.push(PageEdges { page_id, edges });
    }
    Ok(out)
}
