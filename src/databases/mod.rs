//! Bounty storage.
//!
//! A guild's bounties live in a [`BountyDb`] of [`BountyDivision`]s, one per
//! tech-level band. [`GuildBounties`] wraps the database for concurrent use
//! and wires the divisions' timed tasks back to it.

pub mod bounty_db;
pub mod division;
pub mod guild;
pub mod spawn_delay;

pub use bounty_db::BountyDb;
pub use division::{BountyDivision, DivisionTasks};
pub use guild::{CheckOutcome, GuildBounties};
pub use spawn_delay::{SharedCadence, SpawnCadence};
