//! Trigger dispatcher.
//!
//! Listens for triggers becoming pending and runs the matching trigger
//! handler. A run commits the handler's operations plus `finish_trigger`
//! under the handler's recorded reads and a check that the trigger is still
//! pending; a conflicting commit in between makes it retry.

use super::local::LocalConnection;
use super::Connection;
use crate::error::VelesError;
use crate::schema::{Check, Operation};
use crate::tracer::Tracer;
use crate::tracker::TriggerEvent;
use crate::types::{NodeID, TriggerState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Attempts per run before giving up on a trigger that keeps conflicting
pub const MAX_TRIGGER_ATTEMPTS: usize = 8;

enum Attempt {
    Finished,
    NotPending,
    NoHandler,
}

pub(crate) struct TriggerDispatcher {
    tx: mpsc::UnboundedSender<TriggerEvent>,
    /// Runs in progress; `true` when another kick arrived meanwhile
    in_flight: Mutex<HashMap<(NodeID, String), bool>>,
}

impl TriggerDispatcher {
    pub fn new(tx: mpsc::UnboundedSender<TriggerEvent>) -> Self {
        TriggerDispatcher {
            tx,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Ask for a run of `trigger` on `node`.
    pub fn kick(&self, node: NodeID, trigger: &str) {
        let _ = self.tx.send(TriggerEvent::Pending {
            node,
            trigger: trigger.to_string(),
        });
    }

    pub fn spawn(conn: Weak<LocalConnection>, mut rx: mpsc::UnboundedReceiver<TriggerEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(conn) = conn.upgrade() else {
                    break;
                };
                match event {
                    TriggerEvent::Pending { node, trigger } => {
                        conn.triggers.start(&conn, node, trigger);
                    }
                    TriggerEvent::Obsolete { node, trigger } => {
                        conn.triggers.withdraw(&conn, node, trigger);
                    }
                }
            }
        });
    }

    /// A pending trigger went away.
    ///
    /// An in-flight run cannot commit once the trigger is gone, since its
    /// commit is checked against the pending state. A trigger deleted and
    /// added back is pending again and gets a fresh run.
    fn withdraw(&self, conn: &Arc<LocalConnection>, node: NodeID, trigger: String) {
        let pending = match conn.tracker().get_node(&node) {
            Ok(Some(current)) => current.triggers.get(&trigger) == Some(&TriggerState::Pending),
            Ok(None) => false,
            Err(err) => {
                warn!(node = %node, trigger = %trigger, error = %err, "Could not re-check withdrawn trigger");
                false
            }
        };
        if pending {
            debug!(node = %node, trigger = %trigger, "Trigger re-added, scheduling a fresh run");
            self.start(conn, node, trigger);
        } else {
            debug!(node = %node, trigger = %trigger, "Trigger withdrawn");
        }
    }

    fn start(&self, conn: &Arc<LocalConnection>, node: NodeID, trigger: String) {
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(again) = in_flight.get_mut(&(node, trigger.clone())) {
                *again = true;
                return;
            }
            in_flight.insert((node, trigger.clone()), false);
        }
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                run_trigger(&conn, node, &trigger).await;
                let mut in_flight = conn.triggers.in_flight.lock();
                let key = (node, trigger.clone());
                match in_flight.get_mut(&key) {
                    Some(again) if *again => *again = false,
                    _ => {
                        in_flight.remove(&key);
                        break;
                    }
                }
            }
        });
    }
}

async fn run_trigger(conn: &Arc<LocalConnection>, node: NodeID, trigger: &str) {
    for attempt in 1..=MAX_TRIGGER_ATTEMPTS {
        match try_trigger(conn, node, trigger).await {
            Ok(Attempt::Finished) => {
                debug!(node = %node, trigger, attempt, "Trigger finished");
                return;
            }
            Ok(Attempt::NotPending) => return,
            Ok(Attempt::NoHandler) => {
                debug!(node = %node, trigger, "No handler for pending trigger");
                return;
            }
            Err(VelesError::PreconditionFailed(msg)) => {
                debug!(node = %node, trigger, attempt, reason = %msg, "Trigger run raced a commit, retrying");
            }
            Err(err) => {
                warn!(node = %node, trigger, error = %err, "Trigger handler failed");
                return;
            }
        }
    }
    warn!(node = %node, trigger, "Trigger kept conflicting, leaving it pending");
}

async fn try_trigger(conn: &Arc<LocalConnection>, node: NodeID, trigger: &str) -> Result<Attempt, VelesError> {
    let Some(current) = conn.tracker().get_node(&node)? else {
        return Ok(Attempt::NotPending);
    };
    if current.triggers.get(trigger) != Some(&TriggerState::Pending) {
        return Ok(Attempt::NotPending);
    }
    let handler = conn.plugins().triggers.find(trigger, &current.tags)?;
    let Some(handler) = handler else {
        return Ok(Attempt::NoHandler);
    };

    let mut tracer = Tracer::new(conn.clone());
    tracer.get_tags(node).await?;
    let mut ops = handler.run(&mut tracer, node).await?;
    ops.push(Operation::FinishTrigger {
        node,
        trigger: trigger.to_string(),
    });
    let mut checks = tracer.into_checks();
    checks.push(Check::Trigger {
        node,
        key: trigger.to_string(),
        state: Some(TriggerState::Pending),
    });
    conn.transaction(checks, ops).await?;
    Ok(Attempt::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Subscription, TriggerHandler};
    use crate::schema::{NewNode, Node, Value};
    use crate::tracker::{Event, Tracker};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;

    /// Copies the `name` attribute into the `parsed` data key.
    struct CopyName;

    #[async_trait]
    impl TriggerHandler for CopyName {
        async fn run(&self, tracer: &mut Tracer, node: NodeID) -> Result<Vec<Operation>, VelesError> {
            let name = tracer.get_attr(node, "name").await?;
            Ok(vec![Operation::SetData {
                node,
                key: "parsed".into(),
                data: name,
            }])
        }
    }

    struct Broken;

    #[async_trait]
    impl TriggerHandler for Broken {
        async fn run(&self, _tracer: &mut Tracer, _node: NodeID) -> Result<Vec<Operation>, VelesError> {
            Err(VelesError::Handler("bad header".into()))
        }
    }

    fn file_tags() -> BTreeSet<String> {
        ["file".to_string()].into_iter().collect()
    }

    async fn wait_until(sub: &mut Subscription, done: impl Fn(&Node) -> bool) -> Node {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .expect("trigger progress")
                .expect("live subscription");
            match event {
                Event::Node(node) if done(&node) => return node,
                Event::Node(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    fn finished(node: &Node) -> bool {
        node.triggers.get("parse") == Some(&TriggerState::Done)
    }

    #[tokio::test]
    async fn test_pending_trigger_runs_handler() {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        conn.register_trigger("parse", file_tags(), Arc::new(CopyName))
            .await
            .unwrap();
        let node = NewNode::new(NodeID::root())
            .with_tag("file")
            .with_attr("name", Value::from("a.elf"))
            .with_trigger("parse");
        let id = conn.create(node).await.unwrap();

        let mut sub = conn.get_node_sub(id).await.unwrap();
        let done = wait_until(&mut sub, finished).await;
        assert!(done.data.contains("parsed"));
        assert_eq!(conn.get_data(id, "parsed").await.unwrap(), Some(Value::from("a.elf")));
        assert!(conn.tracker().pending_triggers("parse").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_picks_up_pending_work() {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        let node = NewNode::new(NodeID::root())
            .with_tag("file")
            .with_attr("name", Value::from("b.pe"))
            .with_trigger("parse");
        let id = conn.create(node).await.unwrap();
        let mut sub = conn.get_node_sub(id).await.unwrap();

        conn.register_trigger("parse", file_tags(), Arc::new(CopyName))
            .await
            .unwrap();
        wait_until(&mut sub, finished).await;
        assert_eq!(conn.get_data(id, "parsed").await.unwrap(), Some(Value::from("b.pe")));
    }

    #[tokio::test]
    async fn test_withdrawn_trigger_that_is_pending_again_reruns() {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        let id = conn
            .create(
                NewNode::new(NodeID::root())
                    .with_tag("file")
                    .with_attr("name", Value::from("c.so"))
                    .with_trigger("parse"),
            )
            .await
            .unwrap();
        // Let the creation kick find no handler first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Registered without the usual kick so only the withdrawal can start a run.
        conn.plugins()
            .triggers
            .insert(900, "parse", file_tags(), Arc::new(CopyName))
            .unwrap();
        let mut sub = conn.get_node_sub(id).await.unwrap();

        conn.triggers.withdraw(&conn, id, "parse".into());
        wait_until(&mut sub, finished).await;
        assert_eq!(conn.get_data(id, "parsed").await.unwrap(), Some(Value::from("c.so")));
    }

    #[tokio::test]
    async fn test_withdrawn_trigger_that_is_gone_stays_idle() {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        let id = conn
            .create(NewNode::new(NodeID::root()).with_tag("file").with_trigger("parse"))
            .await
            .unwrap();
        conn.del_trigger(id, "parse").await.unwrap();
        conn.plugins()
            .triggers
            .insert(901, "parse", file_tags(), Arc::new(CopyName))
            .unwrap();

        conn.triggers.withdraw(&conn, id, "parse".into());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.triggers.in_flight.lock().is_empty());
        assert_eq!(conn.get_data(id, "parsed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_handler_leaves_trigger_pending() {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        conn.register_trigger("parse", file_tags(), Arc::new(Broken))
            .await
            .unwrap();
        let id = conn
            .create(NewNode::new(NodeID::root()).with_tag("file").with_trigger("parse"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.tracker().pending_triggers("parse").unwrap(), vec![id]);
    }
}
