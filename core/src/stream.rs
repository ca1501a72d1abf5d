//! Capture and replay of incrementally delivered responses.

use std::future::Future;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;

use crate::error::{InferenceError, Result};
use crate::recording::ChunkRecord;
use crate::request::ChunkStream;

/// Forwards `upstream` unchanged while recording every chunk.
///
/// Once the upstream ends cleanly, the captured sequence (terminated by
/// [`ChunkRecord::End`]) is handed to `on_complete` and awaited; an error it
/// returns is yielded as the stream's final item. An upstream error is forwarded and ends
/// the capture without calling `on_complete`, as does dropping the stream
/// early.
pub fn capture<F, Fut>(mut upstream: ChunkStream, on_complete: F) -> ChunkStream
where
    F: FnOnce(Vec<ChunkRecord>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut captured = Vec::new();
        let mut failed = false;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    captured.push(ChunkRecord::from_bytes(&chunk));
                    yield Ok(chunk);
                }
                Err(err) => {
                    tracing::warn!(chunk_count = captured.len(), "stream failed mid-capture; discarding: {err}");
                    failed = true;
                    yield Err(err);
                    break;
                }
            }
        }
        if !failed {
            captured.push(ChunkRecord::End);
            if let Err(err) = on_complete(captured).await {
                yield Err(err);
            }
        }
    })
}

/// Re-emits a recorded chunk sequence with its original boundaries.
pub fn replay(chunks: &[ChunkRecord]) -> Result<ChunkStream> {
    let mut items: Vec<Bytes> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match chunk.to_bytes() {
            Some(Ok(bytes)) => items.push(bytes),
            Some(Err(err)) => {
                return Err(InferenceError::Decode(format!(
                    "recorded chunk is not valid base64: {err}"
                )));
            }
            None => break,
        }
    }
    Ok(stream::iter(items.into_iter().map(Ok)).boxed())
}
