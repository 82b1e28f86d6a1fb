//! Merge and save use cases over the network model.
//!
//! # Responsibility
//! - Deduplicate freshly built transient networks against known structure.
//! - Commit what remains through the aggregate repositories.
//! - Keep per-transaction dedup memory shared by both steps.

pub mod mirror_service;
pub mod network_transaction;
pub mod transaction_data;
pub mod uniquify;
