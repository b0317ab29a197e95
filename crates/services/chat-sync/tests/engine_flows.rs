//! End-to-end engine flows against the in-memory backend.

mod common;

use chat_sync::engine::TransferState;
use chat_sync::types::api::{OutboundFile, PullMode, SyncResponse, SyncedConversation};
use chat_sync::types::channel::ChannelKey;
use chat_sync::types::event::{ConnectionStatus, CustomEvent, StreamSignal, TransportEvent};
use chat_sync::types::message::{CorrelationId, Message, TransferStatus};
use chat_sync::types::payload::Payload;
use chat_sync::{ChatEngine, ChatSyncError, EngineEvent};
use common::{MockBackend, SELF_UID, UploadScript, VISITOR_UID, channel, confirmed};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn stream(ch: &ChannelKey, signal: StreamSignal) -> TransportEvent {
    TransportEvent::Custom(CustomEvent {
        channel: Some(ch.clone()),
        signal,
    })
}

fn live(msg: Message) -> TransportEvent {
    TransportEvent::Message { message: msg }
}

fn synced(ch: &ChannelKey, unread: u32, last_msg_seq: u64) -> SyncedConversation {
    SyncedConversation {
        channel: ch.clone(),
        unread,
        timestamp: 1_700_000_000,
        last_msg_seq,
        version: 7,
        recents: Vec::new(),
    }
}

async fn message(engine: &ChatEngine, ch: &ChannelKey, id: &CorrelationId) -> Message {
    engine
        .window(ch)
        .await
        .and_then(|w| w.find_by_correlation(id).cloned())
        .unwrap()
}

/// Poll until `check` holds, failing after about two seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn png() -> Vec<u8> {
    let img = image::RgbImage::new(4, 3);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

#[tokio::test]
async fn test_open_then_load_older_merges_in_order() {
    common::init_tracing();
    let backend = MockBackend::new();
    let ch = channel("c1");
    backend.seed_history(&ch, 1..=50);
    let engine = backend.engine();

    engine.open_channel(&ch).await.unwrap();
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (21..=50).collect::<Vec<_>>());
    assert!(window.has_more_older);
    assert!(!window.has_more_newer);

    assert!(engine.load_older(&ch, 10).await.unwrap());
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (11..=50).collect::<Vec<_>>());
    assert_eq!(window.older_cursor, 11);

    let requests = backend.history_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].start_message_seq, 21);
    assert_eq!(requests[1].pull_mode, PullMode::Down);
    assert_eq!(requests[1].limit, 10);

    // live message lands at the live edge and does not count as unread
    engine.ingest(live(confirmed(&ch, 51, VISITOR_UID, "new"))).await;
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences().last(), Some(&51));
    let conv = engine.conversation(&ch).await.unwrap();
    assert_eq!(conv.unread, 0);
    assert_eq!(conv.preview, "new");
}

#[tokio::test]
async fn test_context_load_detaches_window() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    backend.seed_history(&ch, 1..=100);
    let engine = backend.engine();

    assert!(engine.load_context(&ch, 50, 10).await.unwrap());
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (46..=55).collect::<Vec<_>>());
    assert!(window.has_more_older);
    assert!(window.has_more_newer);

    // a detached window defers live traffic to load_newer
    engine.ingest(live(confirmed(&ch, 101, VISITOR_UID, "late"))).await;
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences().last(), Some(&55));
}

#[tokio::test]
async fn test_open_channel_at_uses_context_page_size() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    backend.seed_history(&ch, 1..=100);
    let engine = backend.engine();

    engine.open_channel_at(&ch, 30).await.unwrap();
    assert_eq!(engine.active_channel().await, Some(ch.clone()));
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (11..=50).collect::<Vec<_>>());

    // walking forward reattaches the window to the live edge
    while engine.window(&ch).await.unwrap().has_more_newer {
        assert!(engine.load_newer(&ch, 30).await.unwrap());
    }
    assert_eq!(engine.window(&ch).await.unwrap().newer_cursor, 100);
}

#[tokio::test]
async fn test_send_from_detached_window_keeps_gap_loadable() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    backend.seed_history(&ch, 1..=120);
    backend.next_seq.store(121, Ordering::SeqCst);
    let engine = backend.engine();
    engine.open_channel_at(&ch, 50).await.unwrap();
    assert_eq!(engine.window(&ch).await.unwrap().newer_cursor, 70);

    let id = engine.send_text(&ch, "jumping in").await;
    assert_eq!(message(&engine, &ch, &id).await.sequence, 121);
    let window = engine.window(&ch).await.unwrap();
    assert!(window.has_more_newer);
    assert_eq!(window.newer_cursor, 70);

    while engine.window(&ch).await.unwrap().has_more_newer {
        assert!(engine.load_newer(&ch, 30).await.unwrap());
    }
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (31..=121).collect::<Vec<_>>());
    assert_eq!(window.newer_cursor, 121);
    assert_eq!(backend.history_requests()[2].start_message_seq, 70);
}

#[tokio::test]
async fn test_send_while_streaming_cancels_stream_first() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();

    let k0 = CorrelationId::from("k0");
    engine
        .ingest(stream(&ch, StreamSignal::Start { id: k0.clone() }))
        .await;
    engine
        .ingest(stream(
            &ch,
            StreamSignal::Content {
                id: k0.clone(),
                data: "Thinking".into(),
            },
        ))
        .await;
    assert!(engine.is_streaming().await);

    let id = engine.send_text(&ch, "hello").await;

    assert!(!engine.is_streaming().await);
    let cancels = backend.cancels.lock().unwrap().clone();
    assert_eq!(cancels, vec![(k0.clone(), Some("new_message".to_string()))]);
    assert_eq!(backend.sends.lock().unwrap().len(), 1);

    // the interrupted answer keeps its partial text
    let ai = message(&engine, &ch, &k0).await;
    assert!(!ai.is_streaming());
    assert_eq!(ai.payload, Payload::text("Thinking"));

    let sent = message(&engine, &ch, &id).await;
    assert_eq!(sent.sequence, 100);
    assert_eq!(sent.status, None);
    assert_eq!(sent.reason_code, Some(1));
    assert!(engine.pending_transfers().await.is_empty());

    // late chunks of the cancelled stream are dropped
    engine
        .ingest(stream(
            &ch,
            StreamSignal::Content {
                id: k0.clone(),
                data: " more".into(),
            },
        ))
        .await;
    assert!(!engine.is_streaming().await);
    assert_eq!(message(&engine, &ch, &k0).await.payload, Payload::text("Thinking"));
}

#[tokio::test]
async fn test_failed_send_then_retry() {
    let backend = MockBackend::new();
    backend.failing_sends.store(1, Ordering::SeqCst);
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();

    let id = engine.send_text(&ch, "hello").await;
    let msg = message(&engine, &ch, &id).await;
    assert!(msg.is_failed());
    assert_eq!(msg.reason_code, Some(0));
    let pending = engine.pending_transfers().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, TransferState::Failed);

    engine.retry(&id).await.unwrap();
    let msg = message(&engine, &ch, &id).await;
    assert!(!msg.is_failed());
    assert!(msg.is_confirmed());
    assert!(engine.pending_transfers().await.is_empty());

    let sends = backend.sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].client_msg_no, sends[1].client_msg_no);
    assert_eq!(sends[1].from_uid, SELF_UID);

    // nothing left to retry
    assert!(engine.retry(&id).await.is_err());
}

#[tokio::test]
async fn test_echo_before_push_failure_keeps_message_delivered() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();
    let gate = backend.hold_pushes();
    backend.failing_pushes.store(1, Ordering::SeqCst);

    let sending = {
        let engine = engine.clone();
        let ch = ch.clone();
        tokio::spawn(async move { engine.send_text(&ch, "hello").await })
    };
    eventually(|| {
        let backend = Arc::clone(&backend);
        async move { !backend.pushes.lock().unwrap().is_empty() }
    })
    .await;
    let id = backend.pushes.lock().unwrap()[0].client_msg_no.clone();

    let mut echo = confirmed(&ch, 100, SELF_UID, "hello");
    echo.correlation_id = Some(id.clone());
    engine.ingest(live(echo)).await;
    assert!(engine.pending_transfers().await.is_empty());

    gate.notify_one();
    assert_eq!(sending.await.unwrap(), id);
    let msg = message(&engine, &ch, &id).await;
    assert_eq!(msg.sequence, 100);
    assert_eq!(msg.status, None);
    assert!(!msg.is_failed());
    assert!(matches!(engine.retry(&id).await, Err(ChatSyncError::State(_))));
}

#[tokio::test]
async fn test_self_echo_reconciles_optimistic_message() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();

    let id = engine.send_text(&ch, "hello").await;
    let mut echo = confirmed(&ch, 100, SELF_UID, "hello");
    echo.correlation_id = Some(id.clone());
    engine.ingest(live(echo)).await;

    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.messages.len(), 1);
    assert_eq!(window.messages[0].correlation_id.as_ref(), Some(&id));
    // own messages never count as unread
    assert_eq!(engine.conversation(&ch).await.map_or(0, |c| c.unread), 0);
}

#[tokio::test]
async fn test_upload_failure_then_retry_restarts_progress() {
    let backend = MockBackend::new();
    backend.script_upload(UploadScript::FailAt(40));
    backend.script_upload(UploadScript::HoldAt(10));
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();

    let file = OutboundFile::new("shot.png", "image/png", png());
    let id = engine.upload_and_send(&ch, file).await;
    let msg = message(&engine, &ch, &id).await;
    assert_eq!(msg.upload_progress, Some(40));
    assert!(msg.upload_error.is_some());
    assert!(msg.is_failed());

    let retrying = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.retry_upload(&id).await })
    };
    // 10 is only visible if progress restarted from zero
    eventually(|| {
        let engine = engine.clone();
        let ch = ch.clone();
        let id = id.clone();
        async move { message(&engine, &ch, &id).await.upload_progress == Some(10) }
    })
    .await;
    assert!(message(&engine, &ch, &id).await.upload_error.is_none());

    engine.cancel_upload(&id).await.unwrap();
    retrying.await.unwrap().unwrap();
    let msg = message(&engine, &ch, &id).await;
    assert!(msg.cancelled);
    assert_eq!(msg.status, None);
    assert!(engine.pending_transfers().await.is_empty());
    assert!(backend.sends.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_refused_once_upload_is_being_sent() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();
    let gate = backend.hold_sends();

    let uploading = {
        let engine = engine.clone();
        let ch = ch.clone();
        let file = OutboundFile::new("shot.png", "image/png", png());
        tokio::spawn(async move { engine.upload_and_send(&ch, file).await })
    };
    eventually(|| {
        let backend = Arc::clone(&backend);
        async move { !backend.sends.lock().unwrap().is_empty() }
    })
    .await;
    let pending = engine.pending_transfers().await;
    assert_eq!(pending[0].state, TransferState::InFlight(TransferStatus::Sending));
    let id = pending[0].correlation_id.clone();
    assert!(matches!(
        engine.cancel_upload(&id).await,
        Err(ChatSyncError::State(_))
    ));

    gate.notify_one();
    assert_eq!(uploading.await.unwrap(), id);
    let msg = message(&engine, &ch, &id).await;
    assert!(!msg.cancelled);
    assert!(msg.is_confirmed());
    assert!(engine.pending_transfers().await.is_empty());
}

#[tokio::test]
async fn test_retry_upload_after_send_failure_counts_one_attempt() {
    let backend = MockBackend::new();
    backend.failing_sends.store(2, Ordering::SeqCst);
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();

    let file = OutboundFile::new("notes.txt", "text/plain", b"hello".to_vec());
    let id = engine.upload_and_send(&ch, file).await;
    assert_eq!(engine.pending_transfers().await[0].attempts, 1);

    // the file is already uploaded; only the send step is repeated
    engine.retry_upload(&id).await.unwrap();
    let pending = engine.pending_transfers().await;
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[0].state, TransferState::Failed);
    assert_eq!(backend.uploads.lock().unwrap().len(), 1);

    engine.retry_upload(&id).await.unwrap();
    assert!(engine.pending_transfers().await.is_empty());
    assert!(message(&engine, &ch, &id).await.is_confirmed());
}

#[tokio::test]
async fn test_upload_success_sends_image_with_dimensions() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();

    let id = engine
        .upload_and_send(&ch, OutboundFile::new("shot.png", "image/png", png()))
        .await;

    let sends = backend.sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 1);
    match &sends[0].payload {
        Payload::Image {
            url, width, height, ..
        } => {
            assert_eq!(url, "/files/shot.png");
            assert_eq!((*width, *height), (4, 3));
        }
        other => panic!("Expected image payload, got {other:?}"),
    }
    let msg = message(&engine, &ch, &id).await;
    assert!(msg.is_confirmed());
    assert_eq!(msg.upload_progress, None);
}

#[tokio::test]
async fn test_reconnect_resyncs_once() {
    let backend = MockBackend::new();
    let engine = backend.engine();
    let mut events = engine.subscribe();

    engine.connect().await.unwrap();
    assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    backend
        .feed(TransportEvent::Status {
            status: ConnectionStatus::Connected,
        })
        .await;
    eventually(|| {
        let engine = engine.clone();
        async move { engine.connection_status().await == ConnectionStatus::Connected }
    })
    .await;
    assert_eq!(backend.sync_count(), 0);

    for status in [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Connected,
    ] {
        backend.feed(TransportEvent::Status { status }).await;
    }
    eventually(|| {
        let backend = Arc::clone(&backend);
        async move { backend.sync_count() == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.sync_count(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ConnectionChanged(status) = event {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );

    engine.disconnect().await;
    assert_eq!(engine.connection_status().await, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_unread_clear_is_idempotent_and_debounced() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    *backend.sync_response.lock().unwrap() = SyncResponse {
        conversations: vec![synced(&ch, 3, 9)],
        channels: Vec::new(),
    };
    let engine = backend.engine();
    assert!(engine.ensure_synced().await.unwrap());
    assert_eq!(engine.conversation(&ch).await.unwrap().unread, 3);

    assert!(engine.clear_unread(&ch).await);
    assert!(!engine.clear_unread(&ch).await);

    engine.ingest(live(confirmed(&ch, 10, VISITOR_UID, "hi"))).await;
    assert_eq!(engine.conversation(&ch).await.unwrap().unread, 1);
    assert!(engine.clear_unread(&ch).await);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.unread_calls(), vec![(ch.clone(), 0)]);
    assert_eq!(engine.conversation(&ch).await.unwrap().unread, 0);
}

#[tokio::test]
async fn test_stream_chunks_racing_start_concatenate_once() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();
    let id = CorrelationId::from("ai_1");

    let content = |data: &str| {
        stream(
            &ch,
            StreamSignal::Content {
                id: id.clone(),
                data: data.into(),
            },
        )
    };
    engine.ingest(content("Hel")).await;
    engine
        .ingest(stream(&ch, StreamSignal::Start { id: id.clone() }))
        .await;
    engine.ingest(content("lo")).await;

    let msg = message(&engine, &ch, &id).await;
    assert_eq!(msg.stream_buffer.as_deref(), Some("Hello"));
    assert_eq!(engine.conversation(&ch).await, None);

    engine
        .ingest(stream(
            &ch,
            StreamSignal::End {
                id: id.clone(),
                error: None,
            },
        ))
        .await;
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.messages.len(), 1);
    assert_eq!(window.messages[0].payload, Payload::text("Hello"));
    assert!(!window.messages[0].is_streaming());
    assert!(!engine.is_streaming().await);
}

#[tokio::test(start_paused = true)]
async fn test_silent_stream_times_out() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();
    let mut events = engine.subscribe();
    let id = CorrelationId::from("ai_1");

    engine
        .ingest(stream(&ch, StreamSignal::Start { id: id.clone() }))
        .await;
    assert!(engine.is_streaming().await);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!engine.is_streaming().await);
    assert!(!message(&engine, &ch, &id).await.is_streaming());

    let mut busy = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::StreamChanged { busy: b } = event {
            busy.push(b);
        }
    }
    assert_eq!(busy, vec![true, false]);
}

#[tokio::test]
async fn test_ensure_synced_does_not_double_fetch() {
    let backend = MockBackend::new();
    *backend.sync_delay.lock().unwrap() = Some(Duration::from_millis(50));
    let engine = backend.engine();

    let (a, b) = tokio::join!(engine.ensure_synced(), engine.ensure_synced());
    let ran = [a.unwrap(), b.unwrap()];
    assert_eq!(ran.iter().filter(|r| **r).count(), 1);
    assert!(!engine.ensure_synced().await.unwrap());
    assert_eq!(backend.sync_count(), 1);
}

#[tokio::test]
async fn test_resync_heals_gap_in_open_window() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    backend.seed_history(&ch, 1..=10);
    let engine = backend.engine();
    engine.open_channel(&ch).await.unwrap();
    assert_eq!(engine.window(&ch).await.unwrap().newer_cursor, 10);

    // messages 11..15 were missed while offline
    backend.seed_history(&ch, 1..=15);
    *backend.sync_response.lock().unwrap() = SyncResponse {
        conversations: vec![synced(&ch, 5, 15)],
        channels: Vec::new(),
    };
    assert!(engine.resync().await.unwrap());

    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (1..=15).collect::<Vec<_>>());
    assert!(!window.has_more_newer);
    let last = backend.history_requests().pop().unwrap();
    assert_eq!(last.start_message_seq, 10);
    assert_eq!(last.pull_mode, PullMode::Up);
    assert_eq!(engine.version().await, 7);
}

#[tokio::test]
async fn test_resync_after_failed_open_loads_latest_page() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    backend.seed_history(&ch, 1..=100);
    backend.failing_fetches.store(1, Ordering::SeqCst);
    *backend.sync_response.lock().unwrap() = SyncResponse {
        conversations: vec![synced(&ch, 0, 100)],
        channels: Vec::new(),
    };
    let engine = backend.engine();
    assert!(engine.open_channel(&ch).await.is_err());
    assert!(engine.window(&ch).await.unwrap().messages.is_empty());

    assert!(engine.resync().await.unwrap());
    let window = engine.window(&ch).await.unwrap();
    assert_eq!(window.sequences(), (71..=100).collect::<Vec<_>>());
    assert!(window.has_more_older);
    assert!(!window.has_more_newer);
    let requests = backend.history_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].start_message_seq, 0);
    assert_eq!(requests[1].pull_mode, PullMode::Down);
}

#[tokio::test]
async fn test_delete_conversation_is_local_first() {
    let backend = MockBackend::new();
    let ch = channel("c1");
    *backend.sync_response.lock().unwrap() = SyncResponse {
        conversations: vec![synced(&ch, 0, 3), synced(&channel("c2"), 0, 1)],
        channels: Vec::new(),
    };
    let engine = backend.engine();
    engine.ensure_synced().await.unwrap();

    assert!(engine.delete_conversation(&ch).await);
    assert!(!engine.delete_conversation(&ch).await);
    let remaining: Vec<ChannelKey> = engine
        .conversations()
        .await
        .into_iter()
        .map(|c| c.channel)
        .collect();
    assert_eq!(remaining, vec![channel("c2")]);
    assert_eq!(backend.deletes.lock().unwrap().len(), 2);
}
