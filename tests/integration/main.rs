//! End-to-end tests for the cycle lifecycle against in-memory mocks.

mod cycle_flow;
mod mocks;
