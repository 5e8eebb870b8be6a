//! Galley server
//!
//! Carries the collaboration core over WebSockets and exposes health and the
//! internal domain event relay over HTTP.

pub mod api;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;
pub mod types;
pub mod ws;

pub use api::build_router;
pub use server::GalleyServer;
pub use state::AppState;
