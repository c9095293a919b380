//! Accessgate - an authenticating edge gateway for a single on-demand backend
//!
//! Every request passes through an identity check before it reaches the
//! backend:
//! - Signed identity assertions are verified against the provider's published
//!   key set (cached, refreshed on rotation)
//! - Unauthenticated browsers are redirected to the provider's login page
//! - The backend process is started lazily on first traffic and stopped after
//!   an idle window
//! - Authenticated requests are forwarded to the backend unmodified

pub mod auth;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod jwks;
pub mod server;
pub mod supervisor;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
