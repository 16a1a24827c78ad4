//! Core rule engine functionality
//!
//! This module contains the rule model and the path from stored rules to
//! nftables maps:
//!
//! - [`rules`]: Rule documents and the aggregate `Config` projection
//! - [`schedule`]: Time windows and their cron encoding
//! - [`identity`]: Client resolution against the device directory
//! - [`expr`]: `Condition` expressions over the variable map
//! - [`store`]: Indexed rule buckets, variables, token and task settings
//! - [`compiler`]: Store snapshot to PFW maps
//! - [`firewall`]: The plain `/firewall` rules and their maps
//! - [`nft_json`]: nftables JSON batches, checksums and `nft` invocation
//! - [`engine`]: The compiler service keeping applied maps current
//! - [`tasks`]: Periodic task settings
//! - [`error`]: Error types

pub mod compiler;
pub mod engine;
pub mod error;
pub mod expr;
pub mod firewall;
pub mod identity;
pub mod nft_json;
pub mod rules;
pub mod schedule;
pub mod store;
pub mod tasks;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
