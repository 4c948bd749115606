//! Ledger engine core types

pub mod common;
pub mod event;
pub mod operation;
pub mod pending;
pub mod reconcile;

pub use common::*;
pub use event::*;
pub use operation::*;
pub use pending::*;
pub use reconcile::*;
