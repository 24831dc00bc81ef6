//! Client-side map from outstanding request id to its waiter.
//!
//! Two kinds of routes live under an id:
//!
//! - a one-shot call: removed when its reply (or error) arrives
//! - a subscription: its acknowledging reply resolves the waiter once, and
//!   the route then stays in place so later push envelopes with the same id
//!   reach the subscriber's [`Sink`]
//!
//! Resolving an id with no route is a no-op; a reply can legitimately arrive
//! after its caller timed out and abandoned it.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::rpc::{PushEvent, Reply};
use crate::table::callback::Sink;

/// Result delivered to a waiting caller.
pub type CallResult = Result<Reply, ClientError>;

/// Single-fulfilment slot a caller awaits.
pub type Waiter = oneshot::Receiver<CallResult>;

enum Route {
    Call(oneshot::Sender<CallResult>),
    Subscription {
        ack: Option<oneshot::Sender<CallResult>>,
        sink: Sink<PushEvent>,
    },
}

/// Outstanding requests and standing subscriptions of one connection.
#[derive(Default)]
pub struct CorrelationTable {
    routes: HashMap<i64, Route>,
    closed: Option<ClientError>,
    late_resolutions: u64,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self, id: i64) -> Result<(), ClientError> {
        if let Some(reason) = &self.closed {
            return Err(reason.clone());
        }
        if self.routes.contains_key(&id) {
            return Err(ClientError::Protocol {
                message: format!("request id {id} is already outstanding"),
            });
        }
        Ok(())
    }

    /// Register a one-shot call.
    ///
    /// # Errors
    ///
    /// Fails with the disconnect reason once [`cancel_all`](Self::cancel_all)
    /// ran, or if `id` is still outstanding.
    pub fn register(&mut self, id: i64) -> Result<Waiter, ClientError> {
        self.check_open(id)?;
        let (tx, rx) = oneshot::channel();
        self.routes.insert(id, Route::Call(tx));
        Ok(rx)
    }

    /// Register a subscribing call whose id also becomes a push route.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn subscribe(&mut self, id: i64, sink: Sink<PushEvent>) -> Result<Waiter, ClientError> {
        self.check_open(id)?;
        let (tx, rx) = oneshot::channel();
        self.routes.insert(
            id,
            Route::Subscription {
                ack: Some(tx),
                sink,
            },
        );
        Ok(rx)
    }

    /// Resolve the waiter registered under `id`. Returns whether one was
    /// waiting.
    ///
    /// A failed subscription acknowledgement also removes the push route; an
    /// acknowledged subscription is left alone.
    pub fn resolve(&mut self, id: i64, result: CallResult) -> bool {
        let waiter = match self.routes.remove(&id) {
            Some(Route::Call(tx)) => Some(tx),
            Some(Route::Subscription {
                ack: Some(ack),
                sink,
            }) => {
                if result.is_ok() {
                    self.routes
                        .insert(id, Route::Subscription { ack: None, sink });
                }
                Some(ack)
            }
            Some(route @ Route::Subscription { ack: None, .. }) => {
                self.routes.insert(id, route);
                None
            }
            None => None,
        };
        match waiter {
            // The caller may have stopped waiting; that is fine.
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => {
                self.late_resolutions += 1;
                tracing::debug!(id, "reply for id with no waiter, ignoring");
                false
            }
        }
    }

    /// Sink of the subscription under `id`, if any.
    ///
    /// Delivery happens outside the table so a handler may issue new calls.
    pub fn push_route(&self, id: i64) -> Option<Sink<PushEvent>> {
        match self.routes.get(&id) {
            Some(Route::Subscription { sink, .. }) => Some(sink.clone()),
            _ => None,
        }
    }

    /// Remove a subscription's push route.
    pub fn unsubscribe(&mut self, id: i64) -> bool {
        if matches!(self.routes.get(&id), Some(Route::Subscription { .. })) {
            self.routes.remove(&id);
            return true;
        }
        false
    }

    /// Forget a call whose caller gave up. A late reply becomes a no-op.
    pub fn abandon(&mut self, id: i64) -> bool {
        self.routes.remove(&id).is_some()
    }

    /// Resolve every waiter with `reason` and drop every route. Later
    /// registrations fail with the same reason.
    ///
    /// Returns the number of waiters resolved.
    pub fn cancel_all(&mut self, reason: ClientError) -> usize {
        if self.closed.is_none() {
            self.closed = Some(reason.clone());
        }
        let mut resolved = 0;
        for (_, route) in self.routes.drain() {
            let waiter = match route {
                Route::Call(tx) => Some(tx),
                Route::Subscription { ack, .. } => ack,
            };
            if let Some(tx) = waiter {
                let _ = tx.send(Err(reason.clone()));
                resolved += 1;
            }
        }
        resolved
    }

    /// Number of routes (pending calls plus standing subscriptions).
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route exists.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Number of calls still waiting for their first reply.
    pub fn pending_count(&self) -> usize {
        self.routes
            .values()
            .filter(|route| match route {
                Route::Call(_) => true,
                Route::Subscription { ack, .. } => ack.is_some(),
            })
            .count()
    }

    /// Replies that arrived for ids nobody was waiting on.
    pub fn late_resolutions(&self) -> u64 {
        self.late_resolutions
    }

    /// Whether [`cancel_all`](Self::cancel_all) ran.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }
}
