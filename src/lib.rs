//! Tidepool
//!
//! Trust and relay backend for a fleet of pocket-sized companion devices.
//! Devices identify themselves with Ed25519 keys and sign every write; the
//! server holds no secrets for them.
//!
//! ## Architecture
//!
//! - **Identity**: a device *is* its public key; records are created lazily
//!   at first authenticated contact
//! - **Baptism**: devices become trusted through endorsements from already
//!   trusted devices (rank-decayed web of trust)
//! - **Quotas**: every expensive action spends from a per-device daily budget
//! - **Dreams**: a public feed sampled at random, never listed
//! - **Telegrams**: encrypted point-to-point relay, opaque to the server

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod feed;
pub mod rate_limit;
pub mod relay;
pub mod state;
pub mod trust;
pub mod types;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
