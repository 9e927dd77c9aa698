use crate::core::cancel::StreamCancelHandle;
use crate::core::metrics::get_metrics;
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Response body wrapper that notices when the client stops consuming.
///
/// hyper drops the body as soon as the connection goes away; dropping this
/// wrapper drops the inner stream (and with it the upstream response), so
/// the upstream connection is released at the same moment.
pub struct DisconnectStream<S> {
    pub stream: S,
    pub cancel_handle: StreamCancelHandle,
    pub route: &'static str,
}

impl<S> DisconnectStream<S> {
    pub fn new(stream: S, cancel_handle: StreamCancelHandle, route: &'static str) -> Self {
        Self {
            stream,
            cancel_handle,
            route,
        }
    }
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.stream).poll_next(cx);
        // fully drained bodies are never counted as disconnects
        if let Poll::Ready(None) = poll {
            self.cancel_handle.mark_completed();
        }
        poll
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if self.cancel_handle.cancel() {
            tracing::info!(route = self.route, "Client disconnected, upstream stream aborted");
            get_metrics()
                .client_disconnects
                .with_label_values(&[self.route])
                .inc();
        }
    }
}
