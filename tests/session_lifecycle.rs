//! End-to-end session behaviour over scripted capabilities: connect and
//! teardown ordering, address freshness, roster transitions, duplicate
//! offers, and the media control surface.

mod common;

use common::{rig, rig_with_config, wait_until};

use callmesh::{DeviceError, SessionConfig, SessionError, SessionEvent, TrackKind};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn connect_then_disconnect_releases_every_track() {
    init_tracing();
    let rig = rig();

    rig.session.connect("bob", true).await.unwrap();
    assert_eq!(rig.devices.live(), 2);

    let snapshot = rig.session.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.participants.len(), 1);
    assert!(snapshot.participants[0].starts_with("user-bob-"));

    rig.session.disconnect().await.unwrap();
    assert_eq!(rig.devices.live(), 0);
    assert_eq!(rig.signals.destroyed.load(std::sync::atomic::Ordering::SeqCst), 1);

    let snapshot = rig.session.snapshot();
    assert!(!snapshot.connected);
    assert!(snapshot.participants.is_empty());
}

#[tokio::test]
async fn reconnect_never_reuses_a_signaling_address() {
    init_tracing();
    let rig = rig();

    rig.session.connect("bob", false).await.unwrap();
    rig.session.disconnect().await.unwrap();
    rig.session.connect("bob", false).await.unwrap();

    let addresses = rig.signals.registered_addresses();
    assert_eq!(addresses.len(), 2);
    assert_ne!(addresses[0], addresses[1]);
}

#[tokio::test]
async fn connect_while_connected_is_rejected() {
    init_tracing();
    let rig = rig();

    rig.session.connect("bob", false).await.unwrap();
    assert_eq!(
        rig.session.connect("bob", false).await,
        Err(SessionError::AlreadyConnected)
    );
    // And no second device acquisition happened.
    assert_eq!(rig.devices.requests.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permission_denied_stops_before_registration() {
    init_tracing();
    let rig = rig();
    *rig.devices.fail_with.lock().unwrap() = Some(DeviceError::PermissionDenied);

    let err = rig.session.connect("bob", true).await.unwrap_err();
    assert_eq!(err, SessionError::Device(DeviceError::PermissionDenied));
    assert!(rig.signals.registered_addresses().is_empty());
    assert!(!rig.session.snapshot().connected);
}

#[tokio::test]
async fn registration_failure_releases_acquired_media() {
    init_tracing();
    let rig = rig();
    rig.signals.fail_next_registration();

    let err = rig.session.connect("bob", true).await.unwrap_err();
    assert!(matches!(err, SessionError::Registration(_)));
    // The device was opened and must already be fully released.
    assert_eq!(rig.devices.requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(rig.devices.live(), 0);
    assert!(!rig.session.snapshot().connected);

    // The failure is not fatal for the application: a retry works.
    rig.session.connect("bob", true).await.unwrap();
    assert!(rig.session.snapshot().connected);
}

#[tokio::test]
async fn inbound_call_walks_the_roster_through_join_and_leave() {
    init_tracing();
    let rig = rig();
    let mut events = rig.session.subscribe();

    rig.session.connect("ann", false).await.unwrap();
    let self_addr = rig.session.snapshot().participants[0].clone();

    rig.signals.offer("user-bob-xyz").await;
    wait_until(|| rig.signals.has_call("user-bob-xyz")).await;

    // Answered but still negotiating: not on the roster yet.
    assert_eq!(rig.session.snapshot().participants, vec![self_addr.clone()]);

    rig.signals.send_stream("user-bob-xyz", &[TrackKind::Audio]).await;
    wait_until(|| rig.session.snapshot().participants.len() == 2).await;
    assert_eq!(
        rig.session.snapshot().participants,
        vec![self_addr.clone(), "user-bob-xyz".to_string()]
    );

    rig.signals.close_call("user-bob-xyz").await;
    wait_until(|| rig.session.snapshot().participants.len() == 1).await;
    assert_eq!(rig.session.snapshot().participants, vec![self_addr]);

    let mut saw_joined = false;
    let mut saw_left = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::PeerJoined { address } => saw_joined = address == "user-bob-xyz",
            SessionEvent::PeerLeft { address } => saw_left = address == "user-bob-xyz",
            _ => {}
        }
    }
    assert!(saw_joined && saw_left);
}

#[tokio::test]
async fn duplicate_offers_for_one_address_keep_exactly_one_session() {
    init_tracing();
    let rig = rig();
    rig.session.connect("ann", false).await.unwrap();

    rig.signals.offer("user-bob-xyz").await;
    rig.signals.offer("user-bob-xyz").await;
    // The stale session is closed, not leaked.
    wait_until(|| rig.signals.closed() == vec!["user-bob-xyz".to_string()]).await;

    rig.signals.send_stream("user-bob-xyz", &[TrackKind::Audio]).await;
    wait_until(|| rig.session.snapshot().participants.len() == 2).await;

    rig.session.disconnect().await.unwrap();
    // Both the surviving session and the displaced one are closed now.
    assert_eq!(rig.signals.closed().len(), 2);
}

#[tokio::test]
async fn outbound_call_joins_and_disconnect_closes_it() {
    init_tracing();
    let rig = rig();

    assert_eq!(
        rig.session.connect_to("user-zed-9").await,
        Err(SessionError::NoLocalMedia)
    );

    rig.session.connect("ann", false).await.unwrap();
    rig.session.connect_to("user-zed-9").await.unwrap();
    assert!(rig.signals.has_call("user-zed-9"));

    rig.signals.send_stream("user-zed-9", &[TrackKind::Audio]).await;
    wait_until(|| rig.session.snapshot().participants.len() == 2).await;

    rig.session.disconnect().await.unwrap();
    assert_eq!(rig.signals.closed(), vec!["user-zed-9".to_string()]);
    assert_eq!(rig.devices.live(), 0);
}

#[tokio::test]
async fn mute_toggle_flips_track_flags_and_nothing_else() {
    init_tracing();
    let rig = rig();
    rig.session.connect("ann", false).await.unwrap();

    rig.signals.offer("user-bob-xyz").await;
    wait_until(|| rig.signals.has_call("user-bob-xyz")).await;
    rig.signals.send_stream("user-bob-xyz", &[TrackKind::Audio]).await;
    wait_until(|| rig.session.snapshot().participants.len() == 2).await;

    // Sessions start muted by default.
    assert!(rig.session.snapshot().muted);
    assert_eq!(rig.devices.audio_enabled_flags(), vec![false]);

    assert_eq!(rig.session.toggle_mute().await, Ok(false));
    assert_eq!(rig.devices.audio_enabled_flags(), vec![true]);

    assert_eq!(rig.session.toggle_mute().await, Ok(true));
    assert_eq!(rig.devices.audio_enabled_flags(), vec![false]);

    // No session was created, closed, or renegotiated by toggling.
    assert!(rig.signals.closed().is_empty());
    assert_eq!(rig.session.snapshot().participants.len(), 2);
    assert_eq!(rig.signals.registered_addresses().len(), 1);
}

#[tokio::test]
async fn toggles_are_no_ops_while_disconnected() {
    init_tracing();
    let rig = rig();

    assert_eq!(rig.session.toggle_mute().await, Ok(true));
    assert_eq!(rig.session.toggle_video().await, Ok(false));
    assert!(rig.devices.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn video_toggle_and_preview_binding() {
    init_tracing();
    let rig = rig_with_config(SessionConfig {
        start_muted: false,
        ..SessionConfig::default()
    });

    rig.session.connect("ann", true).await.unwrap();
    let snapshot = rig.session.snapshot();
    assert!(snapshot.video_enabled);
    assert!(!snapshot.muted);
    // The local preview sink was bound.
    assert_eq!(rig.sinks.created.load(std::sync::atomic::Ordering::SeqCst), 1);

    assert_eq!(rig.session.toggle_video().await, Ok(false));
    let video_flags: Vec<bool> = rig
        .devices
        .created
        .lock()
        .unwrap()
        .iter()
        .filter(|t| t.kind() == TrackKind::Video)
        .map(|t| t.is_enabled())
        .collect();
    assert_eq!(video_flags, vec![false]);

    rig.session.disconnect().await.unwrap();
    // Preview unbound on teardown.
    assert_eq!(rig.sinks.detached.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn remote_streams_bind_sinks_and_unbind_on_teardown() {
    init_tracing();
    let rig = rig();
    rig.session.connect("ann", false).await.unwrap();

    rig.signals.offer("user-bob-xyz").await;
    wait_until(|| rig.signals.has_call("user-bob-xyz")).await;
    rig.signals
        .send_stream("user-bob-xyz", &[TrackKind::Audio, TrackKind::Video])
        .await;
    wait_until(|| rig.sinks.created.load(std::sync::atomic::Ordering::SeqCst) == 2).await;

    rig.session.disconnect().await.unwrap();
    assert_eq!(rig.sinks.detached.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn volume_is_clamped_into_range() {
    init_tracing();
    let rig = rig();
    rig.session.set_volume(7.0).await.unwrap();
    assert_eq!(rig.session.snapshot().volume, 1.0);
    rig.session.set_volume(-1.0).await.unwrap();
    assert_eq!(rig.session.snapshot().volume, 0.0);
}

#[tokio::test]
async fn disconnect_when_disconnected_is_a_no_op() {
    init_tracing();
    let rig = rig();
    rig.session.disconnect().await.unwrap();
    rig.session.disconnect().await.unwrap();
    assert!(!rig.session.snapshot().connected);
}
