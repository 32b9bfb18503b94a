//! Persistence collaborators of the scheduler.
//!
//! [`Store`] keeps hosts and probes (with [`memory::MemoryStore`] as the
//! process-local implementation), [`database::Database`] receives gathered
//! points and [`broadcast::Broadcaster`] announces store changes to anyone
//! watching.

pub mod broadcast;
pub mod database;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;


pub use database::Database;
pub use memory::MemoryStore;
pub use model::{Host, Probe};
pub use store::{Actor, Scope, Store};
