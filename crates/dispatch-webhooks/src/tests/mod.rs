//! Multi-component delivery scenarios.
//!
//! - `harness.rs`   - Scripted transport and a fully wired in-memory service
//! - `fan_out.rs`   - Delivery creation per enabled endpoint
//! - `execution.rs` - Attempt outcomes and the retry ladder
//! - `replay.rs`    - Manual replay
//! - `sweeper.rs`   - Crash recovery through the due-retry sweep
//! - `pipeline.rs`  - Outbox row to webhook POST with every worker running

mod fan_out;
mod sweeper;
