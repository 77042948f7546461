//! Veil profiles - server endpoints and the share links they come from
//!
//! Turns `vmess://` and `vless://` share links into [`ServerProfile`]s and
//! keeps them in an ordered, identity-deduplicated [`ProfileStore`].
//!
//! # Flow
//!
//! ```text
//! share link ──▶ link::parse ──▶ ServerProfile ──▶ ProfileStore::add
//!                                                      │
//!                                        insert (new row) or update (same row)
//! ```
//!
//! The store is persisted as a JSON array; writes go through
//! [`write_atomic`] so a crash never leaves a truncated file behind.

mod link;
mod persist;
mod ping;
mod profile;
mod store;

pub use link::{parse, ParseError};
pub use persist::write_atomic;
pub use ping::{stagger_delay, tcp_ping, PING_STAGGER, PING_TIMEOUT, PING_UNKNOWN};
pub use profile::{Protocol, ServerProfile, ValidationError};
pub use store::{reselect_after_removal, ProfileStore, StoreChange, StoreError};
