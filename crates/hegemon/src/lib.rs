//! Hegemon is the scheduling and temporal substrate of a grand-strategy
//! simulation. Everything the game does each frame hangs off two cores:
//!
//!  * the [`engine`] module — a per-frame orchestrator that drives
//!    heterogeneous simulation systems across threading placements, measures
//!    them, rebalances chronically slow ones onto dedicated threads, and
//!    disables systems that keep failing;
//!  * the [`time`] module — a logical game clock that emits hierarchical
//!    hour/day/month/year ticks, schedules future events, and moves messages
//!    across a route network at historical courier speeds.
//!
//! The [`bus`] and [`world`] modules are the two collaborators both cores
//! are built against: a typed publish/subscribe bus and a generational
//! component store. Domain systems (economy, diplomacy, military, ...) are
//! external; anything implementing [`engine::System`] can be driven.

pub mod bus;
pub mod engine;
pub mod time;
pub mod world;

pub use hegemon_utils::AnyResult;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
