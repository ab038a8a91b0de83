//! Index engine integration tests
//!
//! Scenarios over the public `trellisdb` surface: range conversion, null
//! policy, collations, collection-valued indexes, transaction isolation and
//! rollback, adaptive link collections and configuration.

#[path = "../common/mod.rs"]
mod common;

mod collation;
mod collection_indexes;
mod config;
mod isolation;
mod link_bags;
mod null_policy;
mod rollback;
mod scenarios;
