//! Live subscriber tracking and fan-out

use crate::server::messages::RefreshEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error};
use uuid::Uuid;

/// Delivery to one subscriber failed; the subscriber is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrySendError {
    #[error("subscriber channel closed")]
    Closed,

    #[error("subscriber outbound queue full")]
    Full,
}

impl<T> From<TrySendError<T>> for RegistrySendError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Closed(_) => RegistrySendError::Closed,
            TrySendError::Full(_) => RegistrySendError::Full,
        }
    }
}

/// A serialized frame queued for one subscriber
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Arc<str>,
}

/// One live notification channel
///
/// The sending half of the subscriber's outbound queue. Once connected the
/// registry owns it; dropping it from the registry closes the queue, which
/// ends the connection's writer.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: Uuid,
    subject_id: Option<i64>,
    tx: mpsc::Sender<OutboundMessage>,
}

impl SubscriberHandle {
    pub fn new(subject_id: Option<i64>, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id,
            tx,
        }
    }

    /// Create a handle together with the receiving end of its queue
    pub fn channel(
        subject_id: Option<i64>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(subject_id, tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subject_id(&self) -> Option<i64> {
        self.subject_id
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), RegistrySendError> {
        self.tx.try_send(msg).map_err(RegistrySendError::from)
    }
}

/// Set of live subscribers
///
/// Membership is guarded by one mutex. Broadcasts copy the member list under
/// the lock and deliver after releasing it.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    handles: Mutex<HashMap<Uuid, Arc<SubscriberHandle>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handle. Returns false if it was already registered.
    pub fn connect(&self, handle: SubscriberHandle) -> bool {
        let id = handle.id;
        let subject_id = handle.subject_id;
        let inserted = {
            let mut handles = self.handles.lock();
            if handles.contains_key(&id) {
                false
            } else {
                handles.insert(id, Arc::new(handle));
                true
            }
        };

        if inserted {
            debug!(conn_id = %id, subject_id = ?subject_id, "Subscriber connected");
        }
        inserted
    }

    /// Remove a handle. Unknown ids are ignored.
    pub fn disconnect(&self, id: Uuid) -> bool {
        let removed = self.handles.lock().remove(&id).is_some();
        if removed {
            debug!(conn_id = %id, "Subscriber disconnected");
        }
        removed
    }

    /// Deliver `event` to every subscriber registered right now
    ///
    /// A subscriber whose queue is closed or full is removed; the rest still
    /// get the event. Returns the number of successful deliveries.
    pub fn broadcast(&self, event: &RefreshEvent) -> usize {
        let snapshot: Vec<Arc<SubscriberHandle>> = self.handles.lock().values().cloned().collect();

        if snapshot.is_empty() {
            debug!("No subscribers for broadcast");
            return 0;
        }

        let payload: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let msg = OutboundMessage { payload };
        let mut delivered = 0;

        for handle in snapshot {
            match handle.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(conn_id = %handle.id, error = %e, "Dropping subscriber after failed send");
                    self.disconnect(handle.id);
                }
            }
        }

        debug!(delivered, "Broadcast complete");
        delivered
    }

    pub fn count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.handles.lock().contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let (handle, _rx) = SubscriberHandle::channel(Some(1), 4);

        assert!(registry.connect(handle.clone()));
        assert!(!registry.connect(handle));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_disconnect_unknown_is_noop() {
        let registry = SubscriberRegistry::new();
        assert!(!registry.disconnect(Uuid::new_v4()));

        let (handle, _rx) = SubscriberHandle::channel(None, 4);
        let id = handle.id();
        registry.connect(handle);

        assert!(registry.disconnect(id));
        assert!(!registry.disconnect(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_delivers_refresh_frame() {
        let registry = SubscriberRegistry::new();
        let (handle, mut rx) = SubscriberHandle::channel(Some(5), 4);
        registry.connect(handle);

        assert_eq!(registry.broadcast(&RefreshEvent::refresh()), 1);

        let msg = rx.try_recv().unwrap();
        assert_eq!(&*msg.payload, r#"{"event":"refresh"}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_empty_registry() {
        let registry = SubscriberRegistry::new();
        assert_eq!(registry.broadcast(&RefreshEvent::refresh()), 0);
    }

    #[test]
    fn test_full_queue_drops_subscriber() {
        let registry = SubscriberRegistry::new();
        let (handle, _rx) = SubscriberHandle::channel(None, 1);
        let id = handle.id();
        registry.connect(handle);

        assert_eq!(registry.broadcast(&RefreshEvent::refresh()), 1);
        // Nobody drained the queue
        assert_eq!(registry.broadcast(&RefreshEvent::refresh()), 0);
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_eviction_closes_queue() {
        let registry = SubscriberRegistry::new();
        let (handle, mut rx) = SubscriberHandle::channel(None, 4);
        let id = handle.id();
        registry.connect(handle);

        registry.disconnect(id);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_send_error_mapping() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        tx.try_send(1).unwrap();
        assert_eq!(RegistrySendError::from(tx.try_send(2).unwrap_err()), RegistrySendError::Full);

        drop(rx);
        assert_eq!(RegistrySendError::from(tx.try_send(3).unwrap_err()), RegistrySendError::Closed);
    }
}
