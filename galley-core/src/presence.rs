//! Presence tracker
//!
//! Turns connection-set transitions and explicit status updates into tenant
//! room broadcasts.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::PresencePolicy;
use crate::errors::{RealtimeError, RealtimeResult};
use crate::fanout::Fanout;
use crate::protocol::{PresenceNotice, PresenceStatus, ServerEvent};
use crate::registry::{ConnectionContext, Detached, PresenceRegistry, Room};
use crate::types::Timestamp;

pub struct PresenceTracker {
    registry: Arc<PresenceRegistry>,
    fanout: Fanout,
    policy: PresencePolicy,
}

impl PresenceTracker {
    pub fn new(registry: Arc<PresenceRegistry>, fanout: Fanout, policy: PresencePolicy) -> Self {
        Self { registry, fanout, policy }
    }

    fn notice(ctx: &ConnectionContext, status: PresenceStatus, timestamp: Timestamp) -> PresenceNotice {
        PresenceNotice {
            user_id: ctx.user_id().clone(),
            display_name: ctx.identity.display_name.clone(),
            status,
            timestamp,
        }
    }

    /// Add the connection to the user's set and announce it
    pub async fn on_connect(&self, ctx: &ConnectionContext) {
        let attached = self.registry.attach(&ctx.tenant_id, ctx.user_id(), &ctx.connection_id).await;

        let announce = match self.policy {
            PresencePolicy::EveryConnect => true,
            PresencePolicy::FirstConnection => attached.first,
        };
        if !announce {
            debug!(user_id = %ctx.user_id(), connections = attached.connections, "Additional connection, online already announced");
            return;
        }

        let event = ServerEvent::UserJoined(Self::notice(ctx, PresenceStatus::Online, Timestamp::now()));
        self.fanout.to_room(&Room::Tenant(ctx.tenant_id.clone()), event, None).await;
    }

    /// Remove the connection; announce offline only when it was the last one
    pub async fn on_disconnect(&self, ctx: &ConnectionContext) {
        match self.registry.detach(&ctx.tenant_id, ctx.user_id(), &ctx.connection_id).await {
            Detached::WentOffline => {
                info!(user_id = %ctx.user_id(), tenant_id = %ctx.tenant_id, "User offline");
                let event = ServerEvent::UserLeft(Self::notice(ctx, PresenceStatus::Offline, Timestamp::now()));
                self.fanout.to_room(&Room::Tenant(ctx.tenant_id.clone()), event, None).await;
            }
            Detached::StillOnline(remaining) => {
                debug!(user_id = %ctx.user_id(), remaining, "Connection closed, user still online");
            }
            Detached::Unknown => {}
        }
    }

    /// Broadcast an explicit status with the last-seen timestamp
    pub async fn update_status(&self, ctx: &ConnectionContext, status: PresenceStatus) -> RealtimeResult<()> {
        if status == PresenceStatus::Offline {
            return Err(RealtimeError::InvalidCommand("status must be online, away or busy".to_string()));
        }

        let last_seen = self
            .registry
            .set_status(&ctx.tenant_id, ctx.user_id(), status)
            .await
            .ok_or(RealtimeError::ConnectionClosed)?;

        let event = ServerEvent::UserPresence(Self::notice(ctx, status, last_seen));
        self.fanout.to_room(&Room::Tenant(ctx.tenant_id.clone()), event, None).await;
        Ok(())
    }

    pub async fn status(&self, ctx: &ConnectionContext) -> PresenceStatus {
        self.registry.status(&ctx.tenant_id, ctx.user_id()).await
    }
}
