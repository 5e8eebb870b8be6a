//! WebSocket transport
//!
//! One actor per socket. The handshake is authenticated before the upgrade,
//! so a rejected client gets a plain HTTP error and nothing is registered.
//! After the upgrade a writer task owns the sink and merges outbound events
//! with control frames, while the reader loop feeds text frames into the
//! session, drives the heartbeat and listens for shutdown.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use galley_core::registry::EventReceiver;
use galley_core::types::{ConnectionId, TenantId};
use galley_core::{Handshake, RealtimeError, Session};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::handlers::bearer_token;
use crate::state::AppState;

/// Control frames queued ahead of events
const CONTROL_BUFFER: usize = 8;

/// How long the writer may take to flush after the reader stops
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Query string of `GET /ws`
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
    pub tenant: Option<String>,
}

/// Build the handshake from `?token=` or a bearer header, plus `?tenant=`
pub fn handshake_from(params: WsParams, headers: &HeaderMap) -> Option<Handshake> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(headers).map(str::to_string))?;

    let handshake = Handshake::new(token);
    Some(match params.tenant.filter(|t| !t.is_empty()) {
        Some(tenant) => handshake.for_tenant(TenantId::new(tenant)),
        None => handshake,
    })
}

/// GET /ws
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if state.shutdown.is_shutting_down().await {
        return Err(ApiError::Unavailable("server is shutting down".to_string()));
    }
    if state.gateway.active_connections().await >= state.server.max_connections {
        warn!(limit = state.server.max_connections, "Connection limit reached");
        return Err(ApiError::Unavailable("connection limit reached".to_string()));
    }

    let handshake = handshake_from(params, &headers)
        .ok_or_else(|| ApiError::Unauthorized("missing session token".to_string()))?;
    let (session, events) = Session::open(state.gateway.clone(), &handshake).await?;

    Ok(ws.on_upgrade(move |socket| run_connection(socket, state, session, events)))
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

/// Drive one upgraded socket until either side goes away
pub async fn run_connection(socket: WebSocket, state: AppState, session: Session, events: EventReceiver) {
    let _drain = state.shutdown.track();
    let mut shutdown = state.shutdown.subscribe();
    let conn = session.context().connection_id.clone();

    let (sink, mut stream) = socket.split();
    let (control, control_rx) = mpsc::channel(CONTROL_BUFFER);
    let mut writer = tokio::spawn(write_loop(sink, events, control_rx, conn.clone()));

    let mut heartbeat = interval(state.server.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let pong_deadline = sleep(state.server.heartbeat_timeout);
    tokio::pin!(pong_deadline);
    let mut awaiting_pong = false;

    debug!(connection_id = %conn, "WebSocket actor started");

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if session.submit_frame(&text).await.is_err() {
                        break "session closed";
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let err = RealtimeError::InvalidCommand("binary frames are not supported".to_string());
                    if session.submit_malformed(err).await.is_err() {
                        break "session closed";
                    }
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection_id = %conn, frame = ?frame, "Client closed");
                    break "client closed";
                }
                Some(Err(e)) => {
                    warn!(connection_id = %conn, error = %e, "WebSocket receive error");
                    break "receive error";
                }
                None => break "stream ended",
            },
            _ = heartbeat.tick() => {
                if control.send(Message::Ping(Vec::new())).await.is_err() {
                    break "writer stopped";
                }
                if !awaiting_pong {
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + state.server.heartbeat_timeout);
                }
            }
            _ = &mut pong_deadline, if awaiting_pong => {
                warn!(connection_id = %conn, "Heartbeat timed out");
                let _ = control.send(close_frame(close_code::AWAY, "heartbeat timeout")).await;
                break "heartbeat timeout";
            }
            _ = shutdown.recv() => {
                let _ = control.send(close_frame(close_code::AWAY, "server shutting down")).await;
                break "server shutdown";
            }
        }
    };

    info!(connection_id = %conn, reason, "WebSocket closing");
    session.close().await;
    drop(control);

    if timeout(WRITER_GRACE, &mut writer).await.is_err() {
        debug!(connection_id = %conn, "Writer did not finish in time");
        writer.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: EventReceiver,
    mut control: mpsc::Receiver<Message>,
    conn: ConnectionId,
) {
    loop {
        let message = tokio::select! {
            biased;
            Some(message) = control.recv() => message,
            Some(event) = events.recv() => match event.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    error!(connection_id = %conn, event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            },
            else => break,
        };

        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(connection_id = %conn, error = %e, "WebSocket send failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
