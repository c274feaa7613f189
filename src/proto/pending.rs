//! Correlation tables: replies awaited by id.

use crate::error::VelesError;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub struct Pending<T> {
    slots: Mutex<HashMap<u64, oneshot::Sender<T>>>,
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Pending {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Pending<T> {
    /// Start waiting for the reply to `id`.
    pub fn open(&self, id: u64) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        rx
    }

    /// Deliver a reply; `false` when nobody waits for `id`.
    pub fn complete(&self, id: u64, value: T) -> bool {
        match self.slots.lock().remove(&id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, id: u64) {
        self.slots.lock().remove(&id);
    }

    /// Drop every waiter; their receivers observe a lost connection.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Await a reply opened with [`Pending::open`].
pub async fn wait<T>(rx: oneshot::Receiver<T>) -> Result<T, VelesError> {
    rx.await
        .map_err(|_| VelesError::ConnectionLost("peer went away before replying".to_string()))
}
