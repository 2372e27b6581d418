//! Multicast event channels.
//!
//! An [`EventChannel`] is an ordered list of handlers invoked on every
//! [`emit`](EventChannel::emit). Handlers run in subscription order and are
//! plain boxed closures; the engine's own handlers capture nothing but
//! copyable ids and push typed delivery records into the sink passed to
//! `emit`, so no handler ever owns engine state.
//!
//! The sink type `S` is chosen by the channel's owner. The engine uses a
//! delivery queue (see the world module) so that a cascade of reactions is
//! collected first and routed afterwards, with no re-entrant borrows.

use std::fmt;

// ---------------------------------------------------------------------------
// SubscriptionToken
// ---------------------------------------------------------------------------

/// Opaque handle identifying one subscription on one channel.
///
/// Returned by [`EventChannel::subscribe`] and redeemed by
/// [`EventChannel::unsubscribe`]. Tokens are never reused by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

// ---------------------------------------------------------------------------
// EventChannel
// ---------------------------------------------------------------------------

/// Handler signature: a mutable sink plus the event arguments.
type Handler<S, A> = Box<dyn FnMut(&mut S, &A)>;

/// An ordered multicast channel.
///
/// `S` is the sink type handed to every handler on emit; `A` is the argument
/// type of the event.
pub struct EventChannel<S, A> {
    handlers: Vec<(SubscriptionToken, Handler<S, A>)>,
    next_token: u64,
}

impl<S, A> EventChannel<S, A> {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            next_token: 0,
        }
    }

    /// Add a handler, returning the token that removes it again.
    ///
    /// Handlers are invoked in the order they were subscribed.
    pub fn subscribe(&mut self, handler: Handler<S, A>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;
        self.handlers.push((token, handler));
        token
    }

    /// Remove the handler registered under `token`.
    ///
    /// Returns `true` if a handler was removed, `false` if the token was
    /// unknown (already unsubscribed or from another channel).
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token);
        self.handlers.len() != before
    }

    /// Invoke every handler with `args`, in subscription order.
    pub fn emit(&mut self, sink: &mut S, args: &A) {
        for (_, handler) in &mut self.handlers {
            handler(sink, args);
        }
    }

    /// Drop every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the channel has no subscribers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S, A> Default for EventChannel<S, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> fmt::Debug for EventChannel<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
