//! Webhook capture and replay.
//!
//! Inbound deliveries are stored byte-for-byte, listed newest first through
//! compound cursors, and can be replayed to an outbound target once the target
//! passes SSRF validation.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod ingest;
pub mod pagination;
pub mod replay;
pub mod ssrf;
