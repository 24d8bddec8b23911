//! Bounded FIFO of warm machines.
//!
//! The channel is the synchronization primitive: one producer (the pool
//! maintainer) and any number of consumers (control-plane run handlers).
//! A full channel blocks the producer, which is the backpressure signal;
//! a closed channel tells consumers the node is shutting down.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

use super::registry::Machine;

#[derive(Debug, Error)]
#[error("warm pool is closed")]
pub struct PoolClosed;

pub struct WarmPool {
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<Arc<Machine>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Machine>>>,
}

impl WarmPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    #[allow(dead_code)] // public API exercised in tests, useful for monitoring
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the pool already holds `capacity` machines. A closed pool
    /// reports full so the maintainer never tries to refill it.
    pub fn is_full(&self) -> bool {
        match &*self.tx.lock().expect("pool sender lock poisoned") {
            Some(tx) => tx.capacity() == 0,
            None => true,
        }
    }

    #[allow(dead_code)] // public API exercised in tests
    pub fn is_closed(&self) -> bool {
        self.tx.lock().expect("pool sender lock poisoned").is_none()
    }

    /// Enqueue a warm machine. Blocks while the pool is full.
    pub async fn push(&self, machine: Arc<Machine>) -> Result<(), PoolClosed> {
        let tx = self
            .tx
            .lock()
            .expect("pool sender lock poisoned")
            .clone()
            .ok_or(PoolClosed)?;
        tx.send(machine).await.map_err(|_| PoolClosed)
    }

    /// Dequeue the next warm machine. Blocks while the pool is empty and
    /// open; returns None once the pool is closed and drained.
    pub async fn take(&self) -> Option<Arc<Machine>> {
        self.rx.lock().await.recv().await
    }

    /// Close the pool: no further enqueues. Machines already queued can
    /// still be dequeued (and are handled by the per-machine stop path).
    pub fn close(&self) {
        self.tx.lock().expect("pool sender lock poisoned").take();
    }
}
