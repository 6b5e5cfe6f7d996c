use crate::flow::Flow;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Keyed concurrent repository of flows. Backed by `DashMap` rather than a
/// single mutex so that `put`/`get` from many driver tasks never contend on
/// one lock. No suspension point ever occurs while holding a shard lock;
/// every method here is synchronous.
#[derive(Clone)]
pub struct FlowStore {
    inner: Arc<DashMap<Uuid, Flow>>,
}

impl FlowStore {
    pub fn new() -> Self {
        FlowStore {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Insert or replace by identifier.
    pub fn put(&self, flow: Flow) {
        self.inner.insert(flow.id, flow);
    }

    pub fn get(&self, id: Uuid) -> Option<Flow> {
        self.inner.get(&id).map(|entry| entry.clone())
    }

    /// All flows, sorted by timestamp descending, ties broken by
    /// identifier so ordering is stable for equal timestamps.
    pub fn list(&self, limit: Option<usize>) -> Vec<Flow> {
        self.find(|_| true, limit)
    }

    /// Filter, then sort-descending, then truncate.
    pub fn find(&self, predicate: impl Fn(&Flow) -> bool, limit: Option<usize>) -> Vec<Flow> {
        let mut matched: Vec<Flow> = self
            .inner
            .iter()
            .map(|entry| entry.clone())
            .filter(|flow| predicate(flow))
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        matched
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}
