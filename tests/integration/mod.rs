//! Integration test suite for pfupdate
//!
//! End-to-end scenarios driving the public [`pfupdate::update::UpdateManager`]
//! API against the in-memory transport, plus CLI checks through the built
//! binary.
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **cli**: `pfupdate` commands that need no network
//! - **failover**: endpoint outages during checks and downloads
//! - **resume**: interrupted downloads picked up after a restart
//! - **rollback**: install failures, automatic and manual rollback
//! - **update_cycle**: check → download → install, version ordering, session guard

mod common;

mod cli;
mod failover;
mod resume;
mod rollback;
mod update_cycle;
