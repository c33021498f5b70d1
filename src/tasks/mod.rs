//! Background Tasks Module
//!
//! Tasks that run alongside a cache engine.
//!
//! # Tasks
//! - Purge: deletes old SQLite entries at configured intervals
//! - Stats: folds hit/miss events into shared counters

mod purge;
mod stats;

pub use purge::spawn_purge_task;
pub use stats::spawn_stats_task;
