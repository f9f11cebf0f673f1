//! # uniqued
//!
//! Session-wide deduplication of in-memory byte blobs.
//!
//! Cooperating desktop-session processes frequently hold byte-identical
//! assets (icons, fonts, translation catalogs, rendered images) in
//! anonymous memory. This crate provides a small daemon that keeps a
//! content-addressed table of sealed memory files, and a client library
//! that turns caller bytes into read-only buffers backed by those shared
//! files, so two processes holding the same content end up mapping the
//! same physical pages.
//!
//! ## How it works
//!
//! - The client copies caller bytes into a sealed memfd (immutable at the
//!   kernel level) and submits the descriptor to the daemon.
//! - The daemon hashes the content; a previously seen digest answers with
//!   the canonical descriptor, an unseen one adopts the submission.
//! - The client maps the winning descriptor read-only and hands back a
//!   refcounted buffer; dropping the last reference tells the daemon to
//!   forget it. Peers that crash are swept when their connection dies.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use uniqued::Unique;
//!
//! let unique = Unique::session();
//!
//! // Blocking: deduplicated before the call returns.
//! let catalog = unique.bytes_sync(&bytes);
//!
//! // Non-blocking: usable immediately, deduplicated in place later.
//! let icon = unique.bytes_async(&other_bytes);
//! unique.dispatch(None);
//! ```
//!
//! Deduplication is strictly best-effort: with no daemon running every
//! call degrades to a private heap copy with the same buffer contract.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bus;
pub mod client;
pub mod error;
pub mod mapping;
pub mod peer;
pub mod sealed;
pub mod service;
pub mod store;

pub use client::{Unique, UniqueBytes};
pub use error::{Error, Result};
pub use service::Service;
