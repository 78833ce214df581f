//! Integration test entry point for courier-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod delivery;
mod outbox;
