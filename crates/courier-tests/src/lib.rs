//! Integration test helpers for courier end-to-end scenarios.

pub mod harness;
