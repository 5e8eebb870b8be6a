//! Test utilities and helpers for Galley
//!
//! Fixtures that seed an in-memory store, plus a client wrapper that drains
//! a session's events with timeouts.

pub mod client;
pub mod fixtures;

pub use client::*;
pub use fixtures::*;
