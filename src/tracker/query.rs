//! Query cache.
//!
//! One manager per (node, query name, encoded params). A manager runs its
//! query in a background task, verifies the recorded checks still hold,
//! publishes the result to every subscriber and then waits on the check
//! subjects. A commit that breaks any recorded check re-arms it.

use super::subscription::{Delivery, Event, Sink, SubEntry, SubKind, SubscriptionId};
use super::transaction::TransactionContext;
use super::TrackerState;
use crate::codec;
use crate::error::VelesError;
use crate::schema::check::check_subjects;
use crate::schema::{Check, Value};
use crate::types::NodeID;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub node: NodeID,
    pub name: String,
    params: Vec<u8>,
}

impl QueryKey {
    pub fn new(node: NodeID, name: impl Into<String>, params: &Value) -> Self {
        QueryKey {
            node,
            name: name.into(),
            params: codec::encode(params),
        }
    }
}

/// Result of one query run together with everything it read
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub result: Result<Value, VelesError>,
    pub checks: Vec<Check>,
}

impl QueryOutcome {
    pub fn into_event(self) -> Event {
        match self.result {
            Ok(result) => Event::Query {
                result,
                checks: self.checks,
            },
            Err(err) => Event::QueryError {
                err,
                checks: self.checks,
            },
        }
    }
}

/// Executes queries on behalf of the tracker
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run_query(&self, node: NodeID, name: &str, params: Value) -> QueryOutcome;
}

/// A scheduled run of one manager
#[derive(Debug, Clone)]
pub(crate) struct QueryRun {
    pub key: QueryKey,
    pub generation: u64,
    pub params: Value,
}

pub(crate) struct QueryManager {
    params: Value,
    subs: BTreeSet<SubscriptionId>,
    generation: u64,
    running: bool,
    published: Option<QueryOutcome>,
    /// Subscribers still owed their first outcome
    awaiting: BTreeSet<SubscriptionId>,
    deps: HashSet<NodeID>,
    list_deps: HashSet<NodeID>,
}

impl TrackerState {
    pub(super) fn subscribe_query(
        &mut self,
        key: QueryKey,
        params: Value,
        sink: Sink,
    ) -> Result<(SubscriptionId, Option<QueryRun>), VelesError> {
        let sub = self.allocate_sub();
        if self.handles.get(&key.node, &*self.backend)?.is_none() {
            let _ = sink.send(Delivery {
                sub,
                event: Event::Error(VelesError::gone(key.node)),
            });
            return Ok((sub, None));
        }

        let mut run = None;
        if !self.queries.contains_key(&key) {
            self.query_deps.entry(key.node).or_default().insert(key.clone());
            self.queries.insert(
                key.clone(),
                QueryManager {
                    params: params.clone(),
                    subs: BTreeSet::new(),
                    generation: 1,
                    running: true,
                    published: None,
                    awaiting: BTreeSet::new(),
                    deps: HashSet::new(),
                    list_deps: HashSet::new(),
                },
            );
            run = Some(QueryRun {
                key: key.clone(),
                generation: 1,
                params,
            });
        }
        let Some(manager) = self.queries.get_mut(&key) else {
            return Err(VelesError::QueryNotFound(key.name));
        };
        manager.subs.insert(sub);
        let entry = SubEntry {
            kind: SubKind::Query { key: key.clone() },
            sink,
        };
        // A running manager holds a stale outcome; the next publish sends the first one.
        match &manager.published {
            Some(published) if !manager.running => entry.send(sub, published.clone().into_event()),
            _ => {
                manager.awaiting.insert(sub);
            }
        }
        self.subs.insert(sub, entry);
        debug!(sub, node = %key.node, query = %key.name, "Subscribed to query");
        Ok((sub, run))
    }

    /// Published outcome of a settled manager, if any.
    pub(super) fn cached_query(&self, key: &QueryKey) -> Option<QueryOutcome> {
        let manager = self.queries.get(key)?;
        if manager.running {
            return None;
        }
        manager.published.clone()
    }

    pub(super) fn detach_query_sub(&mut self, key: &QueryKey, sub: SubscriptionId) {
        let Some(manager) = self.queries.get_mut(key) else {
            return;
        };
        manager.subs.remove(&sub);
        manager.awaiting.remove(&sub);
        if manager.subs.is_empty() {
            self.drop_query(key);
        }
    }

    fn drop_query(&mut self, key: &QueryKey) {
        if let Some(manager) = self.queries.remove(key) {
            self.unindex_deps(key, &manager.deps, &manager.list_deps);
            if let Some(set) = self.query_deps.get_mut(&key.node) {
                set.remove(key);
                if set.is_empty() {
                    self.query_deps.remove(&key.node);
                }
            }
        }
    }

    fn unindex_deps(&mut self, key: &QueryKey, deps: &HashSet<NodeID>, list_deps: &HashSet<NodeID>) {
        for id in deps {
            // The owner node entry is kept for as long as the manager lives.
            if *id == key.node {
                continue;
            }
            if let Some(set) = self.query_deps.get_mut(id) {
                set.remove(key);
                if set.is_empty() {
                    self.query_deps.remove(id);
                }
            }
        }
        for id in list_deps {
            if let Some(set) = self.query_list_deps.get_mut(id) {
                set.remove(key);
                if set.is_empty() {
                    self.query_list_deps.remove(id);
                }
            }
        }
    }

    /// Invalidate the manager and schedule a fresh run.
    fn rearm(&mut self, key: &QueryKey) -> Option<QueryRun> {
        let manager = self.queries.get_mut(key)?;
        manager.generation += 1;
        manager.running = true;
        let deps = std::mem::take(&mut manager.deps);
        let list_deps = std::mem::take(&mut manager.list_deps);
        let run = QueryRun {
            key: key.clone(),
            generation: manager.generation,
            params: manager.params.clone(),
        };
        self.unindex_deps(key, &deps, &list_deps);
        Some(run)
    }

    /// Re-run every manager of query `name`, e.g. after its handlers changed.
    pub(super) fn refresh_queries(&mut self, name: &str) -> Vec<QueryRun> {
        let keys: Vec<QueryKey> = self
            .queries
            .keys()
            .filter(|key| key.name == name)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.rearm(key)).collect()
    }

    fn terminate_query(&mut self, key: &QueryKey, err: VelesError) {
        let subs: Vec<SubscriptionId> = match self.queries.get(key) {
            Some(manager) => manager.subs.iter().copied().collect(),
            None => return,
        };
        for sub in subs {
            self.terminate(sub, err.clone());
        }
        self.drop_query(key);
    }

    /// Store the outcome of a finished run and notify subscribers.
    pub(super) fn publish_query(
        &mut self,
        run: QueryRun,
        outcome: QueryOutcome,
    ) -> Result<Vec<QueryRun>, VelesError> {
        let key = run.key;
        match self.queries.get(&key) {
            Some(manager) if manager.generation == run.generation => {}
            _ => return Ok(Vec::new()),
        }
        if self.handles.get(&key.node, &*self.backend)?.is_none() {
            self.terminate_query(&key, VelesError::gone(key.node));
            return Ok(Vec::new());
        }
        if !self.all_hold(&outcome.checks)? {
            debug!(node = %key.node, query = %key.name, "Query read stale state, re-running");
            return Ok(self.rearm(&key).into_iter().collect());
        }

        let (nodes, lists) = check_subjects(&outcome.checks);
        for id in &nodes {
            self.query_deps.entry(*id).or_default().insert(key.clone());
        }
        for id in &lists {
            self.query_list_deps.entry(*id).or_default().insert(key.clone());
        }

        let Some(manager) = self.queries.get_mut(&key) else {
            return Ok(Vec::new());
        };
        manager.running = false;
        manager.deps = nodes;
        manager.list_deps = lists;
        let changed = manager
            .published
            .as_ref()
            .map_or(true, |old| old.result != outcome.result);
        manager.published = Some(outcome.clone());
        let awaiting = std::mem::take(&mut manager.awaiting);
        for sub in &manager.subs {
            if !changed && !awaiting.contains(sub) {
                continue;
            }
            if let Some(entry) = self.subs.get(sub) {
                entry.send(*sub, outcome.clone().into_event());
            }
        }
        Ok(Vec::new())
    }

    /// Managers whose recorded checks were broken by a commit.
    pub(super) fn invalidate_queries(&mut self, ctx: &TransactionContext) -> Result<Vec<QueryRun>, VelesError> {
        let mut candidates: BTreeSet<(NodeID, String, Vec<u8>)> = BTreeSet::new();
        let mut collect = |keys: Option<&HashSet<QueryKey>>| {
            for key in keys.into_iter().flatten() {
                candidates.insert((key.node, key.name.clone(), key.params.clone()));
            }
        };
        for id in &ctx.node_changed {
            collect(self.query_deps.get(id));
        }
        for (id, _) in &ctx.data_changed {
            collect(self.query_deps.get(id));
        }
        for change in &ctx.bindata_changed {
            collect(self.query_deps.get(&change.node));
        }
        for parent in &ctx.list_changed {
            collect(self.query_list_deps.get(parent));
        }

        let mut runs = Vec::new();
        for (node, name, params) in candidates {
            let key = QueryKey { node, name, params };
            if self.handles.get(&key.node, &*self.backend)?.is_none() {
                self.terminate_query(&key, VelesError::gone(key.node));
                continue;
            }
            let checks = match self.queries.get(&key) {
                Some(manager) if !manager.running => match &manager.published {
                    Some(outcome) => outcome.checks.clone(),
                    None => continue,
                },
                _ => continue,
            };
            if self.all_hold(&checks)? {
                continue;
            }
            debug!(node = %key.node, query = %key.name, "Query invalidated");
            runs.extend(self.rearm(&key));
        }
        Ok(runs)
    }
}
