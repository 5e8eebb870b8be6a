//! Metrics for the collaboration core
//!
//! Recording goes through the `metrics` facade and is a no-op until the
//! binary installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const CONNECTIONS_OPENED: &str = "realtime.connections.opened";
pub const CONNECTIONS_CLOSED: &str = "realtime.connections.closed";
pub const CONNECTIONS_REJECTED: &str = "realtime.connections.rejected";
pub const CONNECTIONS_ACTIVE: &str = "realtime.connections.active";
pub const COMMANDS_TOTAL: &str = "realtime.commands.total";
pub const COMMANDS_FAILED: &str = "realtime.commands.failed";
pub const COMMAND_DURATION: &str = "realtime.command.duration_ms";
pub const EVENTS_DELIVERED: &str = "realtime.events.delivered";
pub const EVENTS_DROPPED: &str = "realtime.events.dropped";
pub const TYPING_EXPIRED: &str = "realtime.typing.expired";
pub const DOMAIN_EVENTS_RELAYED: &str = "realtime.domain_events.relayed";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Connection lifecycle
    describe_counter!(CONNECTIONS_OPENED, "Connections that passed the handshake");
    describe_counter!(CONNECTIONS_CLOSED, "Connections purged from the registries");
    describe_counter!(CONNECTIONS_REJECTED, "Handshakes refused by the identity resolver");
    describe_gauge!(CONNECTIONS_ACTIVE, "Currently registered connections");

    // Commands
    describe_counter!(COMMANDS_TOTAL, "Commands dispatched, labelled by command");
    describe_counter!(COMMANDS_FAILED, "Commands answered with an error event");
    describe_histogram!(COMMAND_DURATION, "Command processing duration in milliseconds");

    // Fan-out
    describe_counter!(EVENTS_DELIVERED, "Events queued to a connection");
    describe_counter!(EVENTS_DROPPED, "Events dropped because a connection queue was full or closed");
    describe_counter!(TYPING_EXPIRED, "Typing indicators cleared by the auto-expiry timer");
    describe_counter!(DOMAIN_EVENTS_RELAYED, "Domain events relayed to tenant rooms");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

pub(crate) fn command_dispatched(command: &'static str) {
    counter!(COMMANDS_TOTAL, "command" => command).increment(1);
}

pub(crate) fn command_failed(command: &'static str, code: &'static str) {
    counter!(COMMANDS_FAILED, "command" => command, "code" => code).increment(1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    label: Option<&'static str>,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, label: None, start: Instant::now() }
    }

    /// Timer tagged with the command being measured
    pub fn for_command(command: &'static str) -> Self {
        Self { name: COMMAND_DURATION, label: Some(command), start: Instant::now() }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let millis = self.start.elapsed().as_secs_f64() * 1000.0;
        match self.label {
            Some(command) => histogram!(self.name, "command" => command).record(millis),
            None => histogram!(self.name).record(millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder() {
        record_counter(EVENTS_DELIVERED, 3);
        record_gauge(CONNECTIONS_ACTIVE, 2.0);
        command_dispatched("channel:join");
        command_failed("channel:join", "forbidden");
    }

    #[test]
    fn test_timer() {
        let timer = Timer::for_command("message:send");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.stop();
        Timer::new("realtime.test.duration_ms").stop();
    }
}
