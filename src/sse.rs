//! SSE emitter: writes the merged event stream to one HTTP client.
//!
//! Reconnection is not supported: the initial frame sets a very large
//! `retry:` value to discourage `EventSource` auto-reconnect. Client
//! disconnect (the response body being dropped) triggers cancellation of
//! the generation through [`DisconnectGuard`].

use std::convert::Infallible;

use axum::body::Body;
use axum::response::Response;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::events::StreamEvent;
use crate::orchestrator::GenerationHandle;

/// `retry:` value sent in the initial frame; one hour, effectively
/// disabling client auto-reconnect.
const RETRY_MS: u64 = 3_600_000;

/// Cancels the generation when the response body is dropped, which covers
/// both client disconnect and normal completion (where the cancel is a
/// no-op on an already-finished generation).
struct DisconnectGuard {
    handle: GenerationHandle,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.handle.is_done() {
            debug!("SSE body dropped with generation still live, cancelling");
        }
        self.handle.cancel();
    }
}

/// Build the SSE response streaming `events` until the merged stream
/// closes.
pub fn sse_response(
    events: impl Stream<Item = StreamEvent> + Send + 'static,
    handle: GenerationHandle,
) -> Response {
    let guard = DisconnectGuard { handle };

    let body_stream = async_stream::stream! {
        let _guard = guard;

        yield Ok::<_, Infallible>(format!("retry: {RETRY_MS}\n\n"));

        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            yield Ok(event.sse_frame());
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    let headers = response.headers_mut();
    headers.insert("Content-Type", "text/event-stream".parse().expect("static header"));
    headers.insert("Cache-Control", "no-cache, no-store".parse().expect("static header"));
    headers.insert("Connection", "keep-alive".parse().expect("static header"));
    headers.insert("X-Accel-Buffering", "no".parse().expect("static header"));
    response
}
