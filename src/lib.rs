//! HLS/M3U8 relay.
//!
//! Fetches upstream playlists, rewrites every segment and variant reference
//! to point back at the relay, and streams segments through in fixed-size
//! chunks. Each upstream stream gets its own session so concurrent streams
//! never resolve against each other's base URL or token.

pub mod cache;
pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod session;
