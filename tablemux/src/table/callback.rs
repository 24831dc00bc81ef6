//! Update/delete subscribers attached to a view or table.
//!
//! Every [`CallbackRegistration`] is tagged with the session that created it,
//! so removing one session's registrations never touches another's on the
//! same view.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::wire::envelope::PushKind;

/// Opaque handle of a server-side session, assigned at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Capability interface for receiving events.
///
/// Returns `false` once the receiver is gone; the registration is then dropped.
pub trait Notify<T>: Send + Sync {
    /// Deliver one event.
    fn notify(&self, event: T) -> bool;
}

impl<T, F> Notify<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn notify(&self, event: T) -> bool {
        self(event);
        true
    }
}

/// Where notifications for one registration go.
pub enum Sink<T> {
    /// Forward into a channel (sessions use this to feed their push writer).
    Channel(mpsc::UnboundedSender<T>),
    /// Invoke a handler synchronously on the delivering task.
    Handler(Arc<dyn Notify<T>>),
}

impl<T> Sink<T> {
    /// Wrap a closure or any other [`Notify`] implementation.
    pub fn handler(handler: impl Notify<T> + 'static) -> Self {
        Sink::Handler(Arc::new(handler))
    }

    /// Deliver an event; `false` if the receiving side is gone.
    pub fn deliver(&self, event: T) -> bool {
        match self {
            Sink::Channel(tx) => tx.send(event).is_ok(),
            Sink::Handler(handler) => handler.notify(event),
        }
    }
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        match self {
            Sink::Channel(tx) => Sink::Channel(tx.clone()),
            Sink::Handler(handler) => Sink::Handler(Arc::clone(handler)),
        }
    }
}

impl<T> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Channel(_) => write!(f, "Sink::Channel"),
            Sink::Handler(_) => write!(f, "Sink::Handler"),
        }
    }
}

/// Payload shape requested by an update subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Notification only.
    #[default]
    Plain,
    /// Notification plus the rows touched by the flushed port, encoded.
    Row,
}

/// What a registration listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Flushes of the table behind a view.
    Update(UpdateMode),
    /// Deletion of the view or table.
    Delete,
}

impl CallbackKind {
    fn same_class(&self, other: &CallbackKind) -> bool {
        matches!(
            (self, other),
            (CallbackKind::Update(_), CallbackKind::Update(_))
                | (CallbackKind::Delete, CallbackKind::Delete)
        )
    }
}

/// Event delivered to a registration's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Id the subscriber registered under.
    pub callback_id: i64,
    /// View or table the event concerns.
    pub source: String,
    /// Update or delete.
    pub event: PushKind,
    /// Port whose batch triggered an update.
    pub port_id: Option<u32>,
    /// Encoded touched rows, for [`UpdateMode::Row`] subscribers.
    pub delta: Option<Bytes>,
}

/// One subscriber.
#[derive(Debug, Clone)]
pub struct CallbackRegistration {
    /// Id the subscriber registered under (the subscribing request id).
    pub callback_id: i64,
    /// What it listens for.
    pub kind: CallbackKind,
    /// Owning session; `None` for host-side registrations.
    pub client_id: Option<ClientId>,
    /// Delivery target.
    pub sink: Sink<Notification>,
}

impl CallbackRegistration {
    /// Build a registration.
    pub fn new(
        callback_id: i64,
        kind: CallbackKind,
        client_id: Option<ClientId>,
        sink: Sink<Notification>,
    ) -> Self {
        Self {
            callback_id,
            kind,
            client_id,
            sink,
        }
    }
}

/// Set of subscribers for one view or table.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    registrations: Vec<CallbackRegistration>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration, replacing one with the same owner, id and class.
    pub fn register(&mut self, registration: CallbackRegistration) {
        self.registrations.retain(|r| {
            !(r.client_id == registration.client_id
                && r.callback_id == registration.callback_id
                && r.kind.same_class(&registration.kind))
        });
        self.registrations.push(registration);
    }

    /// Remove the owner's registration with this id and class.
    pub fn remove(&mut self, client_id: Option<ClientId>, callback_id: i64, kind: CallbackKind) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| {
            !(r.client_id == client_id && r.callback_id == callback_id && r.kind.same_class(&kind))
        });
        self.registrations.len() != before
    }

    /// Remove every registration of the owner with this id, any class.
    pub fn remove_id(&mut self, client_id: Option<ClientId>, callback_id: i64) -> usize {
        let before = self.registrations.len();
        self.registrations
            .retain(|r| !(r.client_id == client_id && r.callback_id == callback_id));
        before - self.registrations.len()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether no one is subscribed.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Whether any update subscriber wants row deltas.
    pub fn wants_rows(&self) -> bool {
        self.registrations
            .iter()
            .any(|r| r.kind == CallbackKind::Update(UpdateMode::Row))
    }

    /// Deliver an update for one port's batch to every update subscriber.
    ///
    /// Returns the number of notifications delivered. Subscribers whose sink
    /// is gone are dropped.
    pub fn notify_update(&mut self, source: &str, port_id: u32, delta: Option<&Bytes>) -> usize {
        let mut delivered = 0;
        self.registrations.retain(|r| {
            let CallbackKind::Update(mode) = r.kind else {
                return true;
            };
            let notification = Notification {
                callback_id: r.callback_id,
                source: source.to_string(),
                event: PushKind::Update,
                port_id: Some(port_id),
                delta: match mode {
                    UpdateMode::Row => delta.cloned(),
                    UpdateMode::Plain => None,
                },
            };
            let alive = r.sink.deliver(notification);
            if alive {
                delivered += 1;
            } else {
                tracing::debug!(
                    source,
                    callback_id = r.callback_id,
                    "dropping update subscriber with closed sink"
                );
            }
            alive
        });
        delivered
    }

    /// Deliver a delete event to every delete subscriber and clear the registry.
    pub fn notify_delete(&mut self, source: &str) -> usize {
        let mut delivered = 0;
        for r in self.registrations.drain(..) {
            if r.kind != CallbackKind::Delete {
                continue;
            }
            let notification = Notification {
                callback_id: r.callback_id,
                source: source.to_string(),
                event: PushKind::Delete,
                port_id: None,
                delta: None,
            };
            if r.sink.deliver(notification) {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn channel_registration(
        callback_id: i64,
        kind: CallbackKind,
        client: u64,
    ) -> (CallbackRegistration, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CallbackRegistration::new(
                callback_id,
                kind,
                Some(ClientId::new(client)),
                Sink::Channel(tx),
            ),
            rx,
        )
    }

    #[test]
    fn test_update_only_reaches_update_subscribers() {
        let mut registry = CallbackRegistry::new();
        let (upd, mut upd_rx) = channel_registration(1, CallbackKind::Update(UpdateMode::Plain), 1);
        let (del, mut del_rx) = channel_registration(2, CallbackKind::Delete, 1);
        registry.register(upd);
        registry.register(del);

        assert_eq!(registry.notify_update("v", 3, None), 1);

        let n = upd_rx.try_recv().expect("update delivered");
        assert_eq!(n.callback_id, 1);
        assert_eq!(n.port_id, Some(3));
        assert_eq!(n.event, PushKind::Update);
        assert!(del_rx.try_recv().is_err());
    }

    #[test]
    fn test_row_mode_receives_delta() {
        let mut registry = CallbackRegistry::new();
        let (plain, mut plain_rx) =
            channel_registration(1, CallbackKind::Update(UpdateMode::Plain), 1);
        let (row, mut row_rx) = channel_registration(2, CallbackKind::Update(UpdateMode::Row), 1);
        registry.register(plain);
        registry.register(row);
        assert!(registry.wants_rows());

        let delta = Bytes::from_static(b"rows");
        registry.notify_update("v", 0, Some(&delta));

        assert_eq!(plain_rx.try_recv().expect("plain").delta, None);
        assert_eq!(row_rx.try_recv().expect("row").delta, Some(delta));
    }

    #[test]
    fn test_remove_requires_owner_and_class() {
        let mut registry = CallbackRegistry::new();
        let (a, _rx) = channel_registration(5, CallbackKind::Update(UpdateMode::Row), 1);
        registry.register(a);

        assert!(!registry.remove(Some(ClientId::new(2)), 5, CallbackKind::Update(UpdateMode::Plain)));
        assert!(!registry.remove(Some(ClientId::new(1)), 5, CallbackKind::Delete));
        assert!(registry.remove(Some(ClientId::new(1)), 5, CallbackKind::Update(UpdateMode::Plain)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_sink_is_dropped() {
        let mut registry = CallbackRegistry::new();
        let (a, rx) = channel_registration(1, CallbackKind::Update(UpdateMode::Plain), 1);
        registry.register(a);
        drop(rx);

        assert_eq!(registry.notify_update("v", 0, None), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_notify_delete_drains() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let mut registry = CallbackRegistry::new();
        registry.register(CallbackRegistration::new(
            9,
            CallbackKind::Delete,
            None,
            Sink::handler(move |n: Notification| seen_clone.lock().push(n.callback_id)),
        ));

        assert_eq!(registry.notify_delete("t"), 1);
        assert!(registry.is_empty());
        assert_eq!(*seen.lock(), vec![9]);
    }
}
