use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use inference_recorder_core::ChunkRecord;
use inference_recorder_core::InferenceError;
use inference_recorder_core::InferenceMode;
use inference_recorder_core::InferenceTransport;
use inference_recorder_core::RecordedResponse;
use pretty_assertions::assert_eq;
use recorder_test_support::Scripted;
use recorder_test_support::ScriptedTransport;
use recorder_test_support::chat_request;
use recorder_test_support::collect_chunks;
use recorder_test_support::interceptor;
use recorder_test_support::sse_chunks;
use recorder_test_support::temp_store;
use serde_json::Value;

/// Feeds chunks to a line-oriented SSE parser and returns the accumulated
/// assistant text after every chunk.
fn partial_states(chunks: &[Bytes]) -> Vec<String> {
    let mut buffer = String::new();
    let mut text = String::new();
    let mut states = Vec::new();
    for chunk in chunks {
        buffer.push_str(std::str::from_utf8(chunk).unwrap());
        while let Some(end) = buffer.find("\n\n") {
            let event: String = buffer.drain(..end + 2).collect();
            let Some(data) = event.trim().strip_prefix("data: ") else {
                continue;
            };
            if let Ok(value) = serde_json::from_str::<Value>(data)
                && let Some(delta) = value["choices"][0]["delta"]["content"].as_str()
            {
                text.push_str(delta);
            }
        }
        states.push(text.clone());
    }
    states
}

#[tokio::test]
async fn replayed_stream_preserves_order_and_boundaries() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::stream(sse_chunks()));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::RecordIfMissing, &store);

    let captured = collect_chunks(recorder.perform(chat_request("Hello!")).await.unwrap()).await;
    let replayed = collect_chunks(recorder.perform(chat_request("Hello!")).await.unwrap()).await;

    assert_eq!(live.calls(), 1);
    let expected: Vec<Bytes> = sse_chunks()
        .into_iter()
        .map(|chunk| Bytes::from_static(chunk.as_bytes()))
        .collect();
    assert_eq!(captured, expected);
    assert_eq!(replayed, expected);
    assert_eq!(partial_states(&replayed), partial_states(&captured));
    assert_eq!(partial_states(&replayed).last().unwrap(), "Hello!");
}

#[tokio::test]
async fn stored_stream_ends_with_terminal_marker() {
    let (_dir, store) = temp_store();
    let recorder = interceptor(
        ScriptedTransport::stream(sse_chunks()),
        InferenceMode::Record,
        &store,
    );
    collect_chunks(recorder.perform(chat_request("Hello!")).await.unwrap()).await;

    let fingerprints = store.fingerprints().unwrap();
    assert_eq!(fingerprints.len(), 1);
    let RecordedResponse::Stream { status, chunks, .. } =
        store.get(&fingerprints[0]).unwrap().unwrap().response
    else {
        panic!("expected a stream recording");
    };
    assert_eq!(status, 200);
    assert_eq!(chunks.len(), sse_chunks().len() + 1);
    assert_eq!(chunks.last(), Some(&ChunkRecord::End));
    assert_eq!(
        chunks[2],
        ChunkRecord::Text {
            data: String::new()
        }
    );
}

#[tokio::test]
async fn stream_is_persisted_only_after_it_is_drained() {
    let (_dir, store) = temp_store();
    let recorder = interceptor(
        ScriptedTransport::stream(sse_chunks()),
        InferenceMode::Record,
        &store,
    );

    let response = recorder.perform(chat_request("Hello!")).await.unwrap();
    assert!(store.fingerprints().unwrap().is_empty());

    collect_chunks(response).await;
    assert_eq!(store.fingerprints().unwrap().len(), 1);
}

#[tokio::test]
async fn abandoned_stream_persists_nothing() {
    let (_dir, store) = temp_store();
    let recorder = interceptor(
        ScriptedTransport::stream(sse_chunks()),
        InferenceMode::Record,
        &store,
    );

    let mut stream = recorder
        .perform(chat_request("Hello!"))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    stream.chunks.next().await.unwrap().unwrap();
    drop(stream);

    assert!(store.fingerprints().unwrap().is_empty());
}

#[tokio::test]
async fn failed_stream_persists_nothing_and_surfaces_the_error() {
    let (_dir, store) = temp_store();
    let recorder = interceptor(
        ScriptedTransport::new([Scripted::BrokenStream(sse_chunks()[..2].to_vec())]),
        InferenceMode::Record,
        &store,
    );

    let stream = recorder
        .perform(chat_request("Hello!"))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    let items: Vec<_> = stream.chunks.collect().await;

    assert_eq!(items.len(), 3);
    assert!(matches!(items[2], Err(InferenceError::Stream(_))));
    assert!(store.fingerprints().unwrap().is_empty());
}
