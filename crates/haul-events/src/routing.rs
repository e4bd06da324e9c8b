//! Event bus routing helpers.
//!
//! # Design
//! - Publication never waits on subscribers; a subscriber that falls behind the
//!   broadcast buffer loses the overwritten events and keeps receiving newer ones.
//! - A bounded replay ring lets late subscribers catch up from a known event id.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::Utc;
use tokio::sync::broadcast::{self, Sender};
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};

use crate::error::{EventBusError, EventBusResult};
use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<Mutex<EventId>>,
}

impl EventBus {
    /// Construct a bus with a custom buffer and replay capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            replay_capacity: capacity,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Construct a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to new events, optionally replaying everything after `since`.
    #[must_use]
    pub fn subscribe(&self, since: Option<EventId>) -> EventStream {
        let receiver = self.sender.subscribe();
        let backlog: VecDeque<EventEnvelope> = since
            .map(|id| self.backlog_since(id).into())
            .unwrap_or_default();
        let watermark = backlog.back().map(|env| env.id);
        EventStream {
            backlog,
            watermark,
            lagged: 0,
            inner: BroadcastStream::new(receiver),
        }
    }

    /// Publish an event to all current subscribers and return its id.
    ///
    /// Delivery is best-effort; having no subscribers is not an error here.
    pub fn publish(&self, event: Event) -> EventId {
        match self.try_publish(event) {
            Ok(id) | Err(EventBusError::NoSubscribers { event_id: id, .. }) => id,
            Err(EventBusError::UnknownStatus { .. }) => 0,
        }
    }

    /// Publish an event, reporting when nobody was listening.
    ///
    /// # Errors
    ///
    /// Returns `EventBusError::NoSubscribers` when the event was recorded in the
    /// replay ring but no live subscriber received it.
    pub fn try_publish(&self, event: Event) -> EventBusResult<EventId> {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            let id = *next;
            *next = next.saturating_add(1);
            id
        };
        let event_kind = event.kind();
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
        trace!(event_id = id, kind = event_kind, "publishing event");
        self.sender
            .send(envelope)
            .map(|_| id)
            .map_err(|_| EventBusError::NoSubscribers {
                event_id: id,
                event_kind,
            })
    }

    /// Last event id observed in the replay buffer.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|env| env.id)
    }

    /// Collect a backlog of events emitted after the specified id.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        self.lock_replay()
            .iter()
            .filter(|env| env.id > id)
            .cloned()
            .collect()
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber stream: replayed backlog first, then live events.
///
/// Lagged receivers skip the events they missed instead of erroring; the
/// number skipped is kept for [`EventStream::take_lagged`].
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    watermark: Option<EventId>,
    lagged: u64,
    inner: BroadcastStream<EventEnvelope>,
}

impl EventStream {
    /// Events dropped since the last call, resetting the count.
    pub fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }
}

impl Stream for EventStream {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(envelope) = this.backlog.pop_front() {
            return Poll::Ready(Some(envelope));
        }
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(envelope))) => {
                    if this.watermark.is_some_and(|mark| envelope.id <= mark) {
                        continue;
                    }
                    return Poll::Ready(Some(envelope));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "event subscriber lagged; dropping events");
                    this.lagged += skipped;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
