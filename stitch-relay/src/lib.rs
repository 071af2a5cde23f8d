//! # stitch-relay
//!
//! Same-origin relay for segmented playback. Media and file-service requests
//! from the player go through `/api/proxy?url=<target>`, which adds permissive
//! CORS headers, forwards `Range` and streams the upstream body back.

pub mod config;
pub mod error;
pub mod logging;
pub mod routes;
pub mod server;

pub use config::RelayConfig;
pub use error::{ApiError, RelayError};
pub use server::{AppState, RelayServer};
