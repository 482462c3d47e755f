//! Cycle investment engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod calibration;
pub mod config;
pub mod engine;
pub mod prices;
pub mod storage;
pub mod strategy;
pub mod types;
