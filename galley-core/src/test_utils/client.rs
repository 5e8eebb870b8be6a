//! Session wrapper that drains events with timeouts

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{timeout, Duration};

use crate::protocol::{ClientCommand, ServerEvent};
use crate::registry::{ConnectionContext, EventReceiver};
use crate::session::Session;
use crate::types::{ConnectionId, UserId};

/// How long `next_event` waits before failing the test
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds, failing the test after [`EVENT_TIMEOUT`]
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polling = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(EVENT_TIMEOUT, polling).await.expect("condition not met in time");
}

pub struct TestClient {
    session: Session,
    events: EventReceiver,
}

impl TestClient {
    pub fn new(session: Session, events: EventReceiver) -> Self {
        Self { session, events }
    }

    pub fn context(&self) -> &ConnectionContext {
        self.session.context()
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.session.context().connection_id
    }

    pub fn user_id(&self) -> &UserId {
        self.session.context().user_id()
    }

    pub async fn send(&self, command: ClientCommand) {
        self.session.submit(command).await.expect("session should accept commands");
    }

    pub async fn send_frame(&self, frame: &str) {
        self.session.submit_frame(frame).await.expect("session should accept frames");
    }

    /// Next event, failing the test after [`EVENT_TIMEOUT`]
    pub async fn next_event(&mut self) -> ServerEvent {
        let event = timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        Arc::unwrap_or_clone(event)
    }

    /// Skip events until one named `name` arrives
    pub async fn expect_event(&mut self, name: &str) -> ServerEvent {
        loop {
            let event = self.next_event().await;
            if event.name() == name {
                return event;
            }
        }
    }

    /// Assert nothing arrives within `window`
    pub async fn assert_silent(&mut self, window: Duration) {
        if let Ok(Some(event)) = timeout(window, self.events.recv()).await {
            panic!("expected no event, got {:?}", event);
        }
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut drained = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => drained.push(Arc::unwrap_or_clone(event)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return drained,
            }
        }
    }

    pub async fn close(self) {
        self.session.close().await;
    }

    /// Close and wait for any command in progress to finish
    pub async fn close_and_drain(self) {
        self.session.close_and_drain().await;
    }
}
