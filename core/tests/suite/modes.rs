use std::sync::Arc;

use inference_recorder_core::DivergencePolicy;
use inference_recorder_core::Fingerprint;
use inference_recorder_core::InferenceError;
use inference_recorder_core::InferenceMode;
use inference_recorder_core::InferenceRequest;
use inference_recorder_core::InferenceTransport;
use inference_recorder_core::Normalizer;
use inference_recorder_core::RecordedResponse;
use inference_recorder_core::RecordingStore;
use pretty_assertions::assert_eq;
use recorder_test_support::Scripted;
use recorder_test_support::ScriptedTransport;
use recorder_test_support::chat_completion;
use recorder_test_support::chat_request;
use recorder_test_support::chat_request_with_id;
use recorder_test_support::interceptor;
use recorder_test_support::temp_store;
use serde_json::json;
use tempfile::TempDir;

fn fingerprint_of(request: &InferenceRequest) -> Fingerprint {
    Fingerprint::of(&Normalizer::default().normalize(request).unwrap())
}

#[tokio::test]
async fn record_then_replay_equivalent_request_offline() {
    let (_dir, store) = temp_store();

    let live = Arc::new(ScriptedTransport::complete(chat_completion("chatcmpl-1", "Hi there")));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::Record, &store);
    let recorded = recorder
        .perform(chat_request_with_id("Hello!", "abc123"))
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(live.calls(), 1);

    let offline = Arc::new(ScriptedTransport::complete(json!({"unused": true})));
    let replayer = interceptor(Arc::clone(&offline), InferenceMode::Replay, &store);
    let replayed = replayer
        .perform(chat_request_with_id("Hello!", "xyz789"))
        .await
        .unwrap()
        .into_complete()
        .unwrap();

    assert_eq!(offline.calls(), 0);
    assert_eq!(replayed.status, recorded.status);
    assert_eq!(replayed.body, recorded.body);
}

#[tokio::test]
async fn replay_matches_stored_recording_field_for_field() {
    let (_dir, store) = temp_store();
    let live = ScriptedTransport::complete(chat_completion("chatcmpl-1", "Hi there"));
    interceptor(live, InferenceMode::Record, &store)
        .perform(chat_request("Hello!"))
        .await
        .unwrap();

    let fingerprint = fingerprint_of(&chat_request("Hello!"));
    let stored = store.get(&fingerprint).unwrap().unwrap();
    let RecordedResponse::Complete {
        status,
        headers,
        body,
    } = stored.response
    else {
        panic!("expected a complete recording");
    };
    assert!(
        headers.iter().all(|(name, _)| name != "set-cookie"),
        "credentials must not be persisted: {headers:?}"
    );

    let replayed = interceptor(
        ScriptedTransport::complete(json!(null)),
        InferenceMode::Replay,
        &store,
    )
    .perform(chat_request("Hello!"))
    .await
    .unwrap()
    .into_complete()
    .unwrap();
    assert_eq!(replayed.status, status);
    assert_eq!(replayed.headers, headers);
    assert_eq!(replayed.body, body);
}

#[tokio::test]
async fn replay_miss_never_reaches_the_network() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::complete(json!({})));
    let replayer = interceptor(Arc::clone(&live), InferenceMode::Replay, &store);

    let err = replayer.perform(chat_request("never recorded")).await.unwrap_err();

    assert_eq!(live.calls(), 0);
    let InferenceError::ReplayMiss {
        fingerprint,
        summary,
    } = &err
    else {
        panic!("expected ReplayMiss, got {err:?}");
    };
    assert_eq!(*fingerprint, fingerprint_of(&chat_request("never recorded")));
    assert!(summary.contains("POST /v1/chat/completions"), "{summary}");
    assert!(summary.contains("llama3.2:3b"), "{summary}");
    assert!(err.to_string().contains(fingerprint.as_str()));
}

#[tokio::test]
async fn record_if_missing_converges_to_one_call_and_one_file() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::complete(chat_completion("chatcmpl-1", "Hi")));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::RecordIfMissing, &store);

    let first = recorder.perform(chat_request("Hello!")).await.unwrap();
    let second = recorder.perform(chat_request("Hello!")).await.unwrap();

    assert_eq!(live.calls(), 1);
    assert_eq!(store.fingerprints().unwrap().len(), 1);
    assert_eq!(
        first.into_complete().unwrap().body,
        second.into_complete().unwrap().body
    );
}

#[tokio::test]
async fn record_mode_always_forwards_and_overwrites() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::new([
        Scripted::Complete(chat_completion("chatcmpl-1", "first")),
        Scripted::Complete(chat_completion("chatcmpl-2", "second")),
    ]));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::Record, &store);

    recorder.perform(chat_request("Hello!")).await.unwrap();
    recorder.perform(chat_request("Hello!")).await.unwrap();

    assert_eq!(live.calls(), 2);
    let fingerprints = store.fingerprints().unwrap();
    assert_eq!(fingerprints.len(), 1);
    let stored = store.get(&fingerprints[0]).unwrap().unwrap();
    let RecordedResponse::Complete { body, .. } = stored.response else {
        panic!("expected a complete recording");
    };
    assert_eq!(body["choices"][0]["message"]["content"], "second");
}

#[tokio::test]
async fn fail_policy_surfaces_divergence_and_keeps_existing() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::new([
        Scripted::Complete(chat_completion("chatcmpl-1", "first")),
        Scripted::Complete(chat_completion("chatcmpl-2", "second")),
    ]));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::Record, &store)
        .with_divergence_policy(DivergencePolicy::Fail);

    recorder.perform(chat_request("Hello!")).await.unwrap();
    let err = recorder.perform(chat_request("Hello!")).await.unwrap_err();

    assert!(matches!(err, InferenceError::Divergence { .. }), "{err:?}");
    let live_response = err.into_live_response().unwrap();
    assert_eq!(live_response.body["choices"][0]["message"]["content"], "second");

    let fingerprint = fingerprint_of(&chat_request("Hello!"));
    let RecordedResponse::Complete { body, .. } = store.get(&fingerprint).unwrap().unwrap().response
    else {
        panic!("expected a complete recording");
    };
    assert_eq!(body["choices"][0]["message"]["content"], "first");
}

#[tokio::test]
async fn rerecording_identical_content_is_not_divergence() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::new([
        Scripted::Complete(chat_completion("chatcmpl-1", "same")),
        Scripted::Complete(chat_completion("chatcmpl-2", "same")),
    ]));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::Record, &store)
        .with_divergence_policy(DivergencePolicy::Fail);

    recorder.perform(chat_request("Hello!")).await.unwrap();
    recorder.perform(chat_request("Hello!")).await.unwrap();
    assert_eq!(live.calls(), 2);
}

#[tokio::test]
async fn live_mode_never_touches_the_store() {
    let (_dir, store) = temp_store();
    interceptor(
        ScriptedTransport::complete(chat_completion("chatcmpl-1", "recorded")),
        InferenceMode::Record,
        &store,
    )
    .perform(chat_request("Hello!"))
    .await
    .unwrap();

    let live = Arc::new(ScriptedTransport::complete(chat_completion("chatcmpl-2", "live")));
    let passthrough = interceptor(Arc::clone(&live), InferenceMode::Live, &store);
    let response = passthrough
        .perform(chat_request("Hello!"))
        .await
        .unwrap()
        .into_complete()
        .unwrap();

    assert_eq!(live.calls(), 1);
    assert_eq!(response.body["choices"][0]["message"]["content"], "live");

    let (_other_dir, untouched) = temp_store();
    interceptor(
        ScriptedTransport::complete(json!({})),
        InferenceMode::Live,
        &untouched,
    )
    .perform(InferenceRequest::post_json("::not a url::", &json!([])))
    .await
    .unwrap();
    assert!(!untouched.dir().exists());
}

#[tokio::test]
async fn malformed_request_fails_replay_and_bypasses_recording() {
    let (_dir, store) = temp_store();
    let malformed = || InferenceRequest::post_json("http://localhost/v1/chat/completions", &json!([1, 2]));

    let offline = Arc::new(ScriptedTransport::complete(json!({})));
    let err = interceptor(Arc::clone(&offline), InferenceMode::Replay, &store)
        .perform(malformed())
        .await
        .unwrap_err();
    assert!(matches!(err, InferenceError::MalformedRequest(_)), "{err:?}");
    assert_eq!(offline.calls(), 0);

    let live = Arc::new(ScriptedTransport::complete(json!({"ok": true})));
    let response = interceptor(Arc::clone(&live), InferenceMode::RecordIfMissing, &store)
        .perform(malformed())
        .await
        .unwrap();
    assert_eq!(response.into_complete().unwrap().body, json!({"ok": true}));
    assert_eq!(live.calls(), 1);
    assert!(store.fingerprints().unwrap().is_empty());
}

#[tokio::test]
async fn provider_errors_are_recorded_and_replayed() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::new([Scripted::ProviderError {
        status: 404,
        message: "model 'missing' not found".to_string(),
    }]));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::RecordIfMissing, &store);

    let recorded = recorder.perform(chat_request("Hello!")).await.unwrap_err();
    let replayed = recorder.perform(chat_request("Hello!")).await.unwrap_err();

    assert_eq!(live.calls(), 1);
    assert_eq!(recorded.to_string(), replayed.to_string());
    let InferenceError::Provider { status, body, .. } = replayed else {
        panic!("expected a provider error");
    };
    assert_eq!(status, 404);
    assert_eq!(body.unwrap()["error"]["message"], "model 'missing' not found");
}

#[tokio::test]
async fn store_write_failure_still_returns_live_response() {
    let dir = TempDir::new().unwrap();
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, "not a directory").unwrap();
    let store = RecordingStore::new(&blocked);

    let live = Arc::new(ScriptedTransport::complete(chat_completion("chatcmpl-1", "Hi")));
    let err = interceptor(Arc::clone(&live), InferenceMode::Record, &store)
        .perform(chat_request("Hello!"))
        .await
        .unwrap_err();

    assert_eq!(live.calls(), 1);
    assert!(err.is_store_error(), "{err:?}");
    assert!(matches!(err, InferenceError::StoreWrite { .. }));
    let response = err.into_live_response().unwrap();
    assert_eq!(response.body["choices"][0]["message"]["content"], "Hi");
}

#[tokio::test]
async fn store_write_failure_keeps_the_provider_error() {
    let dir = TempDir::new().unwrap();
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, "not a directory").unwrap();
    let store = RecordingStore::new(&blocked);

    let live = Arc::new(ScriptedTransport::new([Scripted::ProviderError {
        status: 404,
        message: "model 'missing' not found".to_string(),
    }]));
    let err = interceptor(Arc::clone(&live), InferenceMode::Record, &store)
        .perform(chat_request("Hello!"))
        .await
        .unwrap_err();

    assert!(matches!(err, InferenceError::StoreWrite { .. }), "{err:?}");
    assert!(err.is_store_error());
    let provider = err.into_live_error().unwrap();
    let InferenceError::Provider { status, message, body } = provider else {
        panic!("expected the live provider error, got {provider:?}");
    };
    assert_eq!(status, 404);
    assert_eq!(message, "model 'missing' not found");
    assert!(body.is_some());
}

#[tokio::test]
async fn diverging_provider_error_is_kept_under_fail_policy() {
    let (_dir, store) = temp_store();
    let live = Arc::new(ScriptedTransport::new([
        Scripted::ProviderError {
            status: 404,
            message: "model 'missing' not found".to_string(),
        },
        Scripted::ProviderError {
            status: 503,
            message: "overloaded".to_string(),
        },
    ]));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::Record, &store)
        .with_divergence_policy(DivergencePolicy::Fail);

    recorder.perform(chat_request("Hello!")).await.unwrap_err();
    let err = recorder.perform(chat_request("Hello!")).await.unwrap_err();

    assert!(matches!(err, InferenceError::Divergence { .. }), "{err:?}");
    let provider = err.into_live_error().unwrap();
    assert!(
        matches!(provider, InferenceError::Provider { status: 503, .. }),
        "{provider:?}"
    );
    let fingerprint = fingerprint_of(&chat_request("Hello!"));
    assert_eq!(
        store.get(&fingerprint).unwrap().unwrap().response.status(),
        404
    );
}

#[tokio::test]
async fn corrupted_recording_is_a_store_error_in_replay() {
    let (_dir, store) = temp_store();
    let fingerprint = fingerprint_of(&chat_request("Hello!"));
    std::fs::create_dir_all(store.dir()).unwrap();
    std::fs::write(store.path_for(&fingerprint), "{\"version\": 1").unwrap();

    let live = Arc::new(ScriptedTransport::complete(json!({})));
    let err = interceptor(Arc::clone(&live), InferenceMode::Replay, &store)
        .perform(chat_request("Hello!"))
        .await
        .unwrap_err();

    assert!(matches!(err, InferenceError::Store(_)), "{err:?}");
    assert!(err.is_store_error());
    assert_eq!(live.calls(), 0);
}

#[tokio::test]
async fn independently_configured_interceptors_coexist() {
    let (_a_dir, suite_a) = temp_store();
    let (_b_dir, suite_b) = temp_store();

    let live = Arc::new(ScriptedTransport::complete(chat_completion("chatcmpl-1", "Hi")));
    let recorder = interceptor(Arc::clone(&live), InferenceMode::RecordIfMissing, &suite_a);
    let strict = interceptor(Arc::clone(&live), InferenceMode::Replay, &suite_b);

    recorder.perform(chat_request("Hello!")).await.unwrap();
    let err = strict.perform(chat_request("Hello!")).await.unwrap_err();

    assert!(matches!(err, InferenceError::ReplayMiss { .. }));
    assert_eq!(live.calls(), 1);
    assert_eq!(suite_a.fingerprints().unwrap().len(), 1);
    assert!(suite_b.fingerprints().unwrap().is_empty());
}
