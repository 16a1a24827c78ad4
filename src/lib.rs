//! pfw - packet forwarding and blocking rule engine
//!
//! Control plane for an nftables-based gateway: keeps user rules (block,
//! forward, tag, group, site VPN) in indexed buckets, compiles them against
//! the device directory into named nftables maps, and serves the REST API
//! that edits them.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, time windows, expressions, identity resolution,
//!   the map compiler and the compiler service
//! - [`api`] - axum REST surface (`/plugins/pfw`, `/firewall`)
//! - [`audit`] - JSON-lines trail of every mutating request
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Service settings and atomic state persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Rules are validated before they reach a bucket
//! - Each batch replaces every managed map in one nft transaction
//! - SHA-256 batch checksums skip redundant re-applies
//! - Secrets are masked on every read path
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::rules::{BlockRule, Config, ForwardRule, GroupRule, SiteVpn, TagRule};
