//! In-process broadcast hub.
//!
//! Simulates a shared bus for tests and single-process demos. A frame is
//! delivered to every joined endpoint except the sender. Each endpoint queues
//! at most `ENDPOINT_QUEUE_DEPTH` frames; further frames are dropped until the
//! endpoint catches up, as a datagram socket's receive buffer would.

use super::{Result, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Frames queued per endpoint before new ones are dropped.
pub const ENDPOINT_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    endpoints: HashMap<u64, mpsc::Sender<Vec<u8>>>,
}

/// Shared in-memory medium. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the hub.
    pub fn join(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE_DEPTH);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner.endpoints.insert(id, tx);

        MemoryTransport {
            id,
            hub: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of attached endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).endpoints.len()
    }

    fn deliver(&self, from: u64, frame: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        // Receivers dropped without close() are pruned here
        inner.endpoints.retain(|id, tx| {
            if *id == from {
                return true;
            }
            match tx.try_send(frame.to_vec()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    fn leave(&self, id: u64) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .endpoints
            .remove(&id);
    }
}

/// One endpoint on a `MemoryHub`.
pub struct MemoryTransport {
    id: u64,
    hub: MemoryHub,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn describe(&self) -> String {
        format!("memory endpoint #{}", self.id)
    }

    async fn broadcast(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.hub.deliver(self.id, frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        // A blocked recv() holds the receiver; nothing is ready for us then
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.leave(self.id);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.leave(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_broadcast_reaches_others_not_sender() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();
        let c = hub.join();

        a.broadcast(b"hello").await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"hello");
        assert_eq!(c.recv().await.unwrap(), b"hello");
        assert!(timeout(Duration::from_millis(50), a.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();

        for i in 0..10u8 {
            a.broadcast(&[i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_close_detaches_endpoint() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();
        assert_eq!(hub.endpoint_count(), 2);

        b.close().await.unwrap();
        assert_eq!(hub.endpoint_count(), 1);
        assert!(matches!(b.broadcast(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));

        // Sending into a hub with nobody else is fine
        a.broadcast(b"x").await.unwrap();
    }

    #[tokio::test]
    async fn test_try_recv_takes_only_ready_frames() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();

        assert_eq!(b.try_recv().unwrap(), None);
        a.broadcast(b"one").await.unwrap();
        a.broadcast(b"two").await.unwrap();
        assert_eq!(b.try_recv().unwrap(), Some(b"one".to_vec()));
        assert_eq!(b.try_recv().unwrap(), Some(b"two".to_vec()));
        assert_eq!(b.try_recv().unwrap(), None);

        b.close().await.unwrap();
        assert!(matches!(b.try_recv(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_full_endpoint_drops_new_frames() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();

        for i in 0..ENDPOINT_QUEUE_DEPTH + 10 {
            a.broadcast(&(i as u32).to_be_bytes()).await.unwrap();
        }
        let mut queued = 0;
        while b.try_recv().unwrap().is_some() {
            queued += 1;
        }
        assert_eq!(queued, ENDPOINT_QUEUE_DEPTH);
        // Still attached once drained
        assert_eq!(hub.endpoint_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_detaches_endpoint() {
        let hub = MemoryHub::new();
        let _a = hub.join();
        {
            let _b = hub.join();
            assert_eq!(hub.endpoint_count(), 2);
        }
        assert_eq!(hub.endpoint_count(), 1);
    }
}
