//! Server-Sent Events (SSE) adapter for the ChangeBus
//!
//! Lets a transport forward ledger changes to connected observers. The
//! stream opens with a full-state `bookings-updated` snapshot so a client
//! that connects late starts from the current ledger, then relays every
//! event published after registration.

use crate::events::{LedgerEvent, Subscription};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Convert a ledger event into an SSE event named after its wire type
pub fn to_sse_event(event: &LedgerEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().event(event.event_type()).data(data)),
        Err(e) => {
            warn!("SSE: failed to serialize {}: {}", event.event_type(), e);
            None
        }
    }
}

/// Stream of SSE events: `snapshot` first, then live events from `subscription`
///
/// Ends when the subscription is unregistered from the bus.
pub fn change_event_stream(
    snapshot: LedgerEvent,
    mut subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        info!("SSE: change stream started for {}", subscription.name());

        if let Some(event) = to_sse_event(&snapshot) {
            yield Ok(event);
        }

        while let Some(event) = subscription.recv().await {
            debug!("SSE: forwarding {}", event.event_type());
            if let Some(sse) = to_sse_event(&event) {
                yield Ok(sse);
            }
        }

        info!("SSE: change stream for {} closed", subscription.name());
    }
}

/// Wrap [`change_event_stream`] in an axum SSE response with heartbeats
///
/// # Example
/// ```rust,ignore
/// pub async fn booking_events(
///     State(ctx): State<Arc<BookingContext>>,
/// ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
///     let subscription = ctx.bus().register("sse-client");
///     booking_common::sse::change_event_sse(ctx.full_state_event().await, subscription)
/// }
/// ```
pub fn change_event_sse(
    snapshot: LedgerEvent,
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(change_event_stream(snapshot, subscription)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
