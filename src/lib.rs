//! Crash Report Server
//!
//! Accepts crash reports from desktop clients over a two-phase conversation:
//! a signed handshake that hands out a one-off RSA key, then an encrypted
//! archive upload that is deduplicated on `(tool, version, checksum)`.

pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
