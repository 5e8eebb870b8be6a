//! Per-connection command ordering and teardown

use galley_core::protocol::{ClientCommand, ServerEvent};
use galley_core::test_utils::{wait_until, TestWorld};
use galley_core::types::TenantId;
use galley_core::{Handshake, Session};

#[tokio::test]
async fn test_commands_from_one_connection_run_in_order() {
    let world = TestWorld::new();
    let tenant = TenantId::new("acme");
    let alice = world.user(&tenant, "alice").await;
    let bob = world.user(&tenant, "bob").await;
    let channel = world.channel(&tenant, "general", &[&alice, &bob]).await;

    let a = world.connect(&alice).await;
    let mut b = world.connect(&bob).await;
    world.join(&a, &channel).await;
    world.join(&b, &channel).await;
    b.drain();

    for i in 0..10 {
        a.send(ClientCommand::SendMessage { channel_id: channel.clone(), content: format!("m{}", i), reply_to: None })
            .await;
    }

    for i in 0..10 {
        match b.expect_event("message:new").await {
            ServerEvent::MessageNew(view) => assert_eq!(view.content, format!("m{}", i)),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_malformed_frame_answered_in_arrival_order() {
    let world = TestWorld::new();
    let tenant = TenantId::new("acme");
    let alice = world.user(&tenant, "alice").await;
    let bob = world.user(&tenant, "bob").await;
    let private = world.channel(&tenant, "leads", &[&bob]).await;

    let mut a = world.connect(&alice).await;
    a.drain();

    a.send(ClientCommand::JoinChannel { channel_id: private }).await;
    a.send_frame("{not json").await;

    let codes: Vec<_> = [a.expect_event("error").await, a.expect_event("error").await]
        .into_iter()
        .map(|event| match event {
            ServerEvent::Error { code, .. } => code,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(codes, vec![Some("forbidden".to_string()), Some("invalid_command".to_string())]);
}

#[tokio::test]
async fn test_close_discards_queued_commands() {
    let world = TestWorld::new();
    let tenant = TenantId::new("acme");
    let alice = world.user(&tenant, "alice").await;
    let channel = world.channel(&tenant, "general", &[&alice]).await;
    let a = world.connect(&alice).await;

    for i in 0..20 {
        a.send(ClientCommand::SendMessage { channel_id: channel.clone(), content: format!("m{}", i), reply_to: None })
            .await;
    }
    a.close_and_drain().await;

    assert!(world.store.message_count().await < 20);
    assert_eq!(world.gateway.active_connections().await, 0);
    assert_eq!(world.gateway.registry().rooms.room_count().await, 0);
}

#[tokio::test]
async fn test_dropped_session_is_purged() {
    let world = TestWorld::new();
    let tenant = TenantId::new("acme");
    let alice = world.user(&tenant, "alice").await;
    let bob = world.user(&tenant, "bob").await;

    let mut observer = world.connect(&bob).await;
    let (session, _events) = Session::open(world.gateway.clone(), &Handshake::new(alice.token.clone()))
        .await
        .unwrap();
    observer.drain();
    drop(session);

    let gateway = world.gateway.clone();
    wait_until(move || {
        let gateway = gateway.clone();
        async move { gateway.active_connections().await == 1 }
    })
    .await;
    observer.expect_event("user:left").await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let world = TestWorld::new();
    let tenant = TenantId::new("acme");
    let alice = world.user(&tenant, "alice").await;

    let (session, _events) = Session::open(world.gateway.clone(), &Handshake::new(alice.token.clone()))
        .await
        .unwrap();
    let context = session.context().clone();
    session.close().await;

    assert!(!world.gateway.is_connected(&context.connection_id).await);
    assert!(!world.gateway.disconnect(&context).await);
}
