//! SSE encoding of generation events.

use axum::BoxError;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use std::time::Duration;
use tidepool_core::GenerationEvent;
use tokio_stream::StreamExt;

/// Encode one generation event as an SSE frame: the enum's wire name as
/// the `event:` field, the tagged JSON envelope as the data.
pub fn sse_event(event: &GenerationEvent) -> Result<Event, BoxError> {
    let data = serde_json::to_string(event).map_err(|e| Box::new(e) as BoxError)?;
    Ok(Event::default()
        .event(event.wire_name())
        .data(data)
        .id(uuid::Uuid::new_v4().to_string()))
}

/// Wrap an event stream as an SSE response with keep-alive pings, so
/// proxies do not reap quiet connections mid-generation.
pub fn sse_response<S>(events: S) -> Sse<impl Stream<Item = Result<Event, BoxError>>>
where
    S: Stream<Item = GenerationEvent> + Send + 'static,
{
    let stream = events.map(|event| sse_event(&event));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::{FinishReason, Usage};

    #[test]
    fn event_name_matches_payload_tag() {
        let event = GenerationEvent::Finish {
            model: "tidepool-default".to_string(),
            reason: FinishReason::Stop,
            usage: Usage::default(),
        };
        let frame = sse_event(&event).unwrap();
        let rendered = format!("{frame:?}");
        assert!(rendered.contains("finish"));
        assert!(rendered.contains("total_tokens"));
    }
}
