//! Typing indicator lifecycle under a paused clock

use std::time::Duration;

use galley_core::protocol::{ClientCommand, ServerEvent};
use galley_core::test_utils::{TestClient, TestWorld};
use galley_core::types::{ChannelId, TenantId};

const TIMEOUT: Duration = Duration::from_millis(3000);

fn typing_flag(event: &ServerEvent) -> Option<bool> {
    match event {
        ServerEvent::TypingIndicator { is_typing, .. } => Some(*is_typing),
        _ => None,
    }
}

fn typing_events(events: &[ServerEvent]) -> Vec<bool> {
    events.iter().filter_map(typing_flag).collect()
}

struct Fixture {
    world: TestWorld,
    channel: ChannelId,
    a: TestClient,
    b: TestClient,
}

async fn pair() -> Fixture {
    let world = TestWorld::new();
    let tenant = TenantId::new("acme");
    let alice = world.user(&tenant, "alice").await;
    let bob = world.user(&tenant, "bob").await;
    let channel = world.channel(&tenant, "general", &[&alice, &bob]).await;

    let mut a = world.connect(&alice).await;
    let mut b = world.connect(&bob).await;
    world.join(&a, &channel).await;
    world.join(&b, &channel).await;
    a.expect_event("channel:joined").await;
    a.drain();
    b.drain();

    Fixture { world, channel, a, b }
}

async fn start(client: &TestClient, channel: &ChannelId) {
    client.send(ClientCommand::TypingStart { channel_id: channel.clone() }).await;
}

async fn stop(client: &TestClient, channel: &ChannelId) {
    client.send(ClientCommand::TypingStop { channel_id: channel.clone() }).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_expiry_emits_single_false() {
    let Fixture { world, channel, mut a, mut b } = pair().await;

    start(&a, &channel).await;
    match b.expect_event("typing:indicator").await {
        ServerEvent::TypingIndicator { channel_id, user_id, is_typing } => {
            assert_eq!(channel_id, channel);
            assert_eq!(&user_id, a.user_id());
            assert!(is_typing);
        }
        other => panic!("unexpected {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    stop(&a, &channel).await;
    assert_eq!(typing_flag(&b.expect_event("typing:indicator").await), Some(false));

    // The aborted timer never fires
    b.assert_silent(TIMEOUT * 2).await;
    assert!(!world.gateway.typing().is_typing(&channel, a.user_id()));

    // The sender never sees its own indicator
    assert!(typing_events(&a.drain()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expiry_then_stop_emits_single_false() {
    let Fixture { world, channel, a, mut b } = pair().await;

    start(&a, &channel).await;
    assert_eq!(typing_flag(&b.expect_event("typing:indicator").await), Some(true));

    tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;
    assert_eq!(typing_events(&b.drain()), vec![false]);
    assert!(!world.gateway.typing().is_typing(&channel, a.user_id()));

    // Late stop finds nothing to clear
    stop(&a, &channel).await;
    b.assert_silent(TIMEOUT).await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_rearms_without_duplicate_true() {
    let Fixture { channel, a, mut b, .. } = pair().await;

    start(&a, &channel).await;
    assert_eq!(typing_flag(&b.expect_event("typing:indicator").await), Some(true));

    tokio::time::sleep(Duration::from_millis(2000)).await;
    start(&a, &channel).await;
    tokio::time::sleep(Duration::from_millis(2000)).await;

    // Four seconds in: the first timer would have fired by now
    assert!(typing_events(&b.drain()).is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(typing_events(&b.drain()), vec![false]);

    b.assert_silent(TIMEOUT * 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_purges_pending_indicator() {
    let Fixture { world, channel, a, mut b } = pair().await;
    let typist = a.user_id().clone();

    start(&a, &channel).await;
    assert_eq!(typing_flag(&b.expect_event("typing:indicator").await), Some(true));

    a.close().await;
    assert_eq!(typing_flag(&b.expect_event("typing:indicator").await), Some(false));
    assert!(!world.gateway.typing().is_typing(&channel, &typist));

    tokio::time::sleep(TIMEOUT * 2).await;
    assert!(typing_events(&b.drain()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_typing_requires_channel_membership() {
    let Fixture { world, channel, a: _a, mut b } = pair().await;
    let tenant = TenantId::new("acme");
    let carol = world.user(&tenant, "carol").await;
    let mut c = world.connect(&carol).await;
    c.drain();
    b.drain();

    start(&c, &channel).await;
    match c.next_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code.as_deref(), Some("forbidden")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(typing_events(&b.drain()).is_empty());
    assert!(!world.gateway.typing().is_typing(&channel, c.user_id()));
}

#[tokio::test(start_paused = true)]
async fn test_start_after_disconnect_arms_nothing() {
    let Fixture { world, channel, a, mut b } = pair().await;
    let ctx = a.context().clone();

    // A start that was already dispatched when the connection went away
    assert!(world.gateway.disconnect(&ctx).await);
    let err = world.gateway.typing().start(&ctx, &channel).await.unwrap_err();
    assert_eq!(err.code(), "connection_closed");
    assert!(!world.gateway.typing().is_typing(&channel, &ctx.identity.user_id));

    b.expect_event("user:left").await;
    b.assert_silent(TIMEOUT * 2).await;
}
