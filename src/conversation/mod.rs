//! Crash Report Conversation Protocol
//!
//! Two-phase upload of crash reports:
//! - Phase 1: client sends a signed `{version, clienttime, checksum}`
//!   envelope; the server answers with a fresh public key and an upload URL
//!   carrying a token, or "Nothing to do." if the report is on file
//! - Phase 2: client uploads the archive encrypted with that key; the server
//!   reserves the record, decrypts, checks the stack-trace checksum and
//!   stores the report
//!
//! The uniqueness of `(tool, version, checksum)` in the deduplication store
//! is what keeps two racing uploads of one report from both being stored.

pub mod archive;
pub mod dedup;
pub mod digest;
pub mod keys;
pub mod protocol;
pub mod session;
pub mod types;
pub mod validator;

pub use archive::{build_report_archive, extract_report};
pub use dedup::DeduplicationStore;
pub use digest::{DigestService, Payload};
pub use keys::{public_key_from_pem, KeyExchangeService};
pub use protocol::ConversationProtocol;
pub use session::SessionManager;
pub use types::*;
pub use validator::UploadValidator;
