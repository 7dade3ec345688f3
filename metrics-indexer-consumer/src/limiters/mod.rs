//! Admission control applied before strings are indexed

pub mod cardinality;
pub mod store;

pub use cardinality::{CardinalityLimiter, CardinalityLimiterState, WindowedCardinalityLimiter};
pub use store::{CardinalityStore, MemoryCardinalityStore};
