//! Streaming response tee: forwards upstream bytes to the client as they
//! arrive while simultaneously accumulating a capture buffer for the trace.
//! Grounded on the teacher crate's `sse.rs`, which pipes an upstream SSE
//! body through an `mpsc` channel into an axum `Body`; this keeps that
//! channel/`spawn` shape but drops the token-usage extraction the teacher
//! does mid-stream, since that's out of scope here.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::StreamExt;
use std::future::Future;
use tokio_stream::wrappers::ReceiverStream;

/// Consumes `upstream`, forwarding each chunk into the returned `Body`.
/// Once the upstream stream ends, `on_complete` is invoked with whatever
/// bytes were captured up to that point plus an error message if the
/// stream ended with an I/O error partway through (the buffered partial
/// data is never discarded — the trace still needs it to finalize the
/// attempt). If the client disconnects (the receiver is dropped),
/// forwarding stops but `on_complete` still runs so the trace is
/// finalized exactly once.
pub fn tee_stream<S, F, Fut>(upstream: S, on_complete: F) -> Body
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    F: FnOnce(Bytes, Option<String>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        let mut captured = BytesMut::new();
        let mut stream_error: Option<String> = None;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    captured.extend_from_slice(&bytes);
                    if tx.send(Ok(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    stream_error = Some(e.to_string());
                    let _ = tx
                        .send(Err(std::io::Error::other(e.to_string())))
                        .await;
                    break;
                }
            }
        }

        on_complete(captured.freeze(), stream_error).await;
    });

    Body::from_stream(ReceiverStream::new(rx))
}
