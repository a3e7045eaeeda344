//! Integration test suite for roundtable.
//!
//! These tests exercise real supervised processes end to end: startup
//! handshakes, command exchanges, crash detection and recovery, the three
//! discussion protocols, and session persistence across orchestrator
//! instances.
//!
//! # Test Categories
//!
//! - `supervision`: process lifecycle, timeouts, retry, crash recovery
//! - `discussions`: broadcast, relay, and propose-review protocols
//! - `orchestrators`: full start-all / discuss / stop-all flows
//! - `sessions`: durable session state and recovery across instances
//!
//! # CI Compatibility
//!
//! Participants are small `sh` scripts, not real AI CLIs, so the suite
//! runs without network access or installed agents.


mod orchestrators;
mod sessions;
mod supervision;
