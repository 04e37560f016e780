//! Integration tests for conversation subscriptions and reconnect.

mod helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use helpers::{TestHarness, bodies, drain, message, settle, statuses};
use market_realtime::{ChannelHandlers, ChannelStatus, ConnectionState, ConversationEvent, PresenceState};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_subscribe_and_subscribed() {
    let h = TestHarness::new();
    let mut rx = h.subscribe("conv-1");
    assert_eq!(h.manager.connection_state(), ConnectionState::Connecting);

    h.emit("conv-1", ChannelStatus::Subscribed).await;

    assert_eq!(h.manager.active_channel_count(), 1);
    assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
    assert_eq!(
        h.manager.conversation_state("conv-1"),
        Some(ConnectionState::Connected)
    );
    assert!(h.manager.last_connected_at("conv-1").is_some());
    assert_eq!(statuses(&drain(&mut rx)), vec![ChannelStatus::Subscribed]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_fires_exactly_at_delay() {
    let h = TestHarness::new();
    let mut rx = h.subscribe("conv-1");
    let first = h.channel("conv-1");

    h.emit("conv-1", ChannelStatus::ChannelError).await;
    assert_eq!(h.manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.manager.retry_count("conv-1"), Some(1));
    assert_eq!(statuses(&drain(&mut rx)), vec![ChannelStatus::ChannelError]);

    tokio::time::advance(Duration::from_millis(999)).await;
    settle().await;
    assert_eq!(h.transport.opened_count(), 1);
    assert_eq!(h.manager.current_channel("conv-1"), Some(first));

    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(h.transport.opened_count(), 2);
    assert_eq!(h.transport.open_count(), 1);
    assert!(!h.transport.is_open(first));
    assert_ne!(h.manager.current_channel("conv-1"), Some(first));
    assert_eq!(h.manager.connection_state(), ConnectionState::Connecting);
    assert_eq!(h.manager.pending_retry_delay("conv-1"), None);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.transport.opened_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sequence_is_capped() {
    let h = TestHarness::new();
    let _rx = h.subscribe("conv-1");

    let mut delays = Vec::new();
    for _ in 0..8 {
        delays.push(h.fail_and_reconnect("conv-1").await);
    }

    assert_eq!(
        delays,
        vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
    );
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.manager.retry_count("conv-1"), Some(8));
}

#[tokio::test(start_paused = true)]
async fn test_fourth_failure_waits_eight_seconds() {
    let h = TestHarness::new();
    let _rx = h.subscribe("conv-1");

    for _ in 0..3 {
        h.fail_and_reconnect("conv-1").await;
    }
    h.emit("conv-1", ChannelStatus::ChannelError).await;

    assert_eq!(
        h.manager.pending_retry_delay("conv-1"),
        Some(Duration::from_millis(8000))
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_resets_backoff() {
    let h = TestHarness::new();
    let _rx = h.subscribe("conv-1");

    h.fail_and_reconnect("conv-1").await;
    h.fail_and_reconnect("conv-1").await;
    assert_eq!(h.manager.retry_count("conv-1"), Some(2));

    h.emit("conv-1", ChannelStatus::Subscribed).await;
    assert_eq!(h.manager.retry_count("conv-1"), Some(0));

    h.emit("conv-1", ChannelStatus::ChannelError).await;
    assert_eq!(
        h.manager.pending_retry_delay("conv-1"),
        Some(Duration::from_millis(1000))
    );
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_and_closed_also_reconnect() {
    let h = TestHarness::new();
    let mut rx = h.subscribe("conv-1");

    h.emit("conv-1", ChannelStatus::TimedOut).await;
    assert_eq!(
        h.manager.pending_retry_delay("conv-1"),
        Some(Duration::from_millis(1000))
    );
    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;

    h.emit("conv-1", ChannelStatus::Closed).await;
    assert_eq!(
        h.manager.pending_retry_delay("conv-1"),
        Some(Duration::from_millis(2000))
    );

    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![ChannelStatus::TimedOut, ChannelStatus::Closed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_other_status_is_forwarded_without_reconnect() {
    let h = TestHarness::new();
    let mut rx = h.subscribe("conv-1");

    h.emit("conv-1", ChannelStatus::Other("JOINING".into())).await;

    assert_eq!(h.manager.pending_retry_delay("conv-1"), None);
    assert_eq!(h.manager.retry_count("conv-1"), Some(0));
    assert_eq!(h.manager.connection_state(), ConnectionState::Connecting);
    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![ChannelStatus::Other("JOINING".into())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_replaces_channel_and_timer() {
    let h = TestHarness::new();
    let _first = h.subscribe("conv-1");
    h.emit("conv-1", ChannelStatus::ChannelError).await;
    assert!(h.manager.pending_retry_delay("conv-1").is_some());

    let _second = h.subscribe("conv-1");

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.transport.closed_count(), 1);
    assert_eq!(h.manager.active_channel_count(), 1);
    assert_eq!(h.manager.retry_count("conv-1"), Some(0));
    assert_eq!(h.manager.pending_retry_delay("conv-1"), None);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.transport.opened_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_only_latest_handlers_receive_messages() {
    let h = TestHarness::new();
    let mut first = h.subscribe("conv-1");
    let mut second = h.subscribe("conv-1");
    h.emit("conv-1", ChannelStatus::Subscribed).await;

    assert_eq!(h.transport.publish_insert(message("conv-1", "Is this still available?")), 1);
    settle().await;

    assert!(drain(&mut first).is_empty());
    assert_eq!(
        bodies(&drain(&mut second)),
        vec!["Is this still available?".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_messages_stay_in_their_conversation() {
    let h = TestHarness::new();
    let mut one = h.subscribe("conv-1");
    let mut two = h.subscribe("conv-2");

    h.transport.publish_insert(message("conv-1", "for one"));
    h.transport.publish_insert(message("conv-2", "for two"));
    settle().await;

    assert_eq!(bodies(&drain(&mut one)), vec!["for one".to_string()]);
    assert_eq!(bodies(&drain(&mut two)), vec!["for two".to_string()]);
    assert_eq!(h.metrics.snapshot().messages_delivered, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_cancels_pending_reconnect() {
    let h = TestHarness::new();
    let mut rx = h.subscribe("conv-1");
    h.emit("conv-1", ChannelStatus::ChannelError).await;
    drain(&mut rx);

    h.manager.unsubscribe("conv-1");
    assert_eq!(h.manager.active_channel_count(), 0);
    assert_eq!(h.manager.registration_count(), 0);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(h.transport.opened_count(), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_events_queued_before_unsubscribe_are_dropped() {
    let h = TestHarness::new();
    let mut rx = h.subscribe("conv-1");
    let id = h.channel("conv-1");

    h.transport.emit_status(id, ChannelStatus::Subscribed);
    h.transport.publish_insert(message("conv-1", "late"));
    h.manager.unsubscribe("conv-1");
    settle().await;

    assert!(drain(&mut rx).is_empty());
    assert_eq!(h.metrics.snapshot().reconnects_scheduled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_handler_may_unsubscribe_on_failure() {
    let h = TestHarness::new();
    let manager = h.manager.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let handlers = ChannelHandlers::builder()
        .on_message(|_| {})
        .on_status_change(move |status: &ChannelStatus| {
            seen.fetch_add(1, Ordering::SeqCst);
            if status.is_failure() {
                manager.unsubscribe("conv-1");
            }
        })
        .build()
        .expect("handlers");
    h.manager.subscribe("conv-1", handlers).expect("subscribe");

    h.emit("conv-1", ChannelStatus::ChannelError).await;
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.registration_count(), 0);
    assert_eq!(h.transport.opened_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all_stops_everything() {
    let h = TestHarness::new();
    let mut receivers = vec![h.subscribe("conv-1"), h.subscribe("conv-2"), h.subscribe("conv-3")];
    h.emit("conv-1", ChannelStatus::ChannelError).await;
    h.emit("conv-2", ChannelStatus::Subscribed).await;
    h.emit("conv-3", ChannelStatus::TimedOut).await;
    for rx in receivers.iter_mut() {
        drain(rx);
    }

    h.manager.disconnect_all();

    assert_eq!(h.manager.active_channel_count(), 0);
    assert_eq!(h.manager.registration_count(), 0);
    assert_eq!(h.manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.open_count(), 0);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(h.transport.opened_count(), 3);
    for rx in receivers.iter_mut() {
        assert!(drain(rx).is_empty());
    }
    assert_eq!(h.metrics.snapshot().open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_presence_sync_delivered() {
    let h = TestHarness::new();
    let (handlers, mut rx) = ChannelHandlers::channel(true);
    h.manager.subscribe("conv-1", handlers).expect("subscribe");

    let mut state = PresenceState::new();
    state.insert("seller-3", vec![json!({ "phx_ref": "a" })]);
    assert!(h.transport.set_presence(h.channel("conv-1"), state.clone()));
    settle().await;

    assert_eq!(drain(&mut rx), vec![ConversationEvent::Presence(state)]);
    assert_eq!(h.metrics.snapshot().presence_syncs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_counts_balance() {
    let h = TestHarness::new();
    let _a = h.subscribe("conv-1");
    let _b = h.subscribe("conv-2");
    h.fail_and_reconnect("conv-1").await;
    let _c = h.subscribe("conv-2");
    h.manager.unsubscribe("conv-1");

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.channels_opened, h.transport.opened_count());
    assert_eq!(snapshot.channels_closed, h.transport.closed_count());
    assert_eq!(snapshot.open_channels() as usize, h.manager.active_channel_count());
    assert_eq!(h.manager.active_channel_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_waits_for_running_callback() {
    let h = TestHarness::new();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let handlers = {
        let started = started.clone();
        let finished = finished.clone();
        let calls = calls.clone();
        ChannelHandlers::builder()
            .on_message(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                started.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            })
            .on_status_change(|_| {})
            .build()
            .expect("handlers")
    };
    h.manager.subscribe("conv-1", handlers).expect("subscribe");

    h.transport.publish_insert(message("conv-1", "first"));
    tokio::time::timeout(Duration::from_secs(5), async {
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("callback started");

    h.manager.unsubscribe("conv-1");
    assert!(finished.load(Ordering::SeqCst));

    h.transport.publish_insert(message("conv-1", "second"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
