// =============================================================================
// Order Book — incremental book state and the owning engine
// =============================================================================

pub mod book;
pub mod engine;

pub use book::{ApplyOutcome, BookState};
pub use engine::OrderBookEngine;
