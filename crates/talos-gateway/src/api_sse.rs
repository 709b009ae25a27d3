//! Server-sent events transport at `/api/events/sse`.

use crate::AppState;
use axum::{
    extract::{Extension, Query},
    response::{sse::Event, Sse},
};
use chrono::{DateTime, Utc};
use futures_util::stream::{unfold, Stream};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::{convert::Infallible, sync::Arc};
use talos_stream::{slow_consumer_message, Mailbox, MailboxItem, Termination};
use talos_types::{Filters, ServerMessage};
use tokio_stream::StreamExt;

/// Handler for `GET /api/events/sse`.
///
/// Every query parameter becomes an equality filter on string values. The
/// stream opens with a `meta` event carrying the session id, then one
/// `audit_event` per matching envelope (SSE id = cursor). An evicted
/// client gets a final `error` event.
pub async fn sse_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filters: Filters = params
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    let session_id = sse_session_id(Utc::now(), &mut rand::thread_rng());
    let mailbox = state.registry.register_poll(session_id.clone(), filters);
    let idle = state.config.stream.sse_keepalive();

    let connected = Event::default()
        .event("meta")
        .data(json!({ "status": "connected", "session_id": session_id }).to_string());

    let events = unfold(Some(mailbox), move |mailbox: Option<Mailbox>| async move {
        let mut mailbox = mailbox?;
        loop {
            match mailbox.next(idle).await {
                MailboxItem::Message(message) => {
                    if let Some(event) = audit_event(&message) {
                        return Some((Ok(event), Some(mailbox)));
                    }
                }
                MailboxItem::Idle => {
                    return Some((Ok(Event::default().comment("keep-alive")), Some(mailbox)));
                }
                MailboxItem::Terminated(Termination::SlowConsumer { limit }) => {
                    tracing::info!(session_id = %mailbox.session_id(), limit, "ending evicted sse stream");
                    let data = serde_json::to_string(&slow_consumer_message(limit))
                        .unwrap_or_else(|_| "{}".to_string());
                    return Some((Ok(Event::default().event("error").data(data)), None));
                }
                MailboxItem::Closed => return None,
            }
        }
    });

    Sse::new(tokio_stream::once(Ok::<_, Infallible>(connected)).chain(events))
}

fn audit_event(message: &ServerMessage) -> Option<Event> {
    let ServerMessage::Event { event, cursor, .. } = message else {
        return None;
    };
    match serde_json::to_string(event.as_ref()) {
        Ok(data) => Some(Event::default().event("audit_event").id(cursor.as_str()).data(data)),
        Err(e) => {
            tracing::error!(event_id = %event.event_id, error = %e, "failed to serialize audit event");
            None
        }
    }
}

/// `sse-<unix millis>-<6 random alphanumerics>`.
pub fn sse_session_id<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> String {
    let suffix: String = (0..6).map(|_| char::from(rng.sample(Alphanumeric))).collect();
    format!("sse-{}-{}", now.timestamp_millis(), suffix)
}
