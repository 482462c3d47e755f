//! Strategy: exit rules applied to open positions each iteration.

pub mod sell;

pub use sell::evaluate_sell_decision;
