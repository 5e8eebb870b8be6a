//! Domain event relay
//!
//! One-way sink other backend subsystems use to push typed events to every
//! live connection of a tenant. No acknowledgement, no retry.

use tracing::debug;

use crate::errors::{RealtimeError, RealtimeResult};
use crate::fanout::Fanout;
use crate::metrics::{record_counter, DOMAIN_EVENTS_RELAYED};
use crate::protocol::ServerEvent;
use crate::registry::Room;
use crate::types::{TenantId, Timestamp};

#[derive(Clone)]
pub struct DomainEventRelay {
    fanout: Fanout,
}

impl DomainEventRelay {
    pub fn new(fanout: Fanout) -> Self {
        Self { fanout }
    }

    /// Fan `{eventType, payload, timestamp}` out to the tenant room.
    /// Returns the number of connections reached.
    pub async fn broadcast(
        &self,
        tenant: &TenantId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> RealtimeResult<usize> {
        let event_type = event_type.trim();
        if event_type.is_empty() {
            return Err(RealtimeError::InvalidCommand("eventType must not be empty".to_string()));
        }

        let event = ServerEvent::DomainEvent {
            event_type: event_type.to_string(),
            payload,
            timestamp: Timestamp::now(),
        };
        let reached = self.fanout.to_room(&Room::Tenant(tenant.clone()), event, None).await;

        record_counter(DOMAIN_EVENTS_RELAYED, 1);
        debug!(tenant_id = %tenant, event_type, reached, "Relayed domain event");
        Ok(reached)
    }
}
