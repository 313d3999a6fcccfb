//! # Spendgate Engine
//!
//! The admission core: everything between "a request wants to spend
//! money" and "the ledger says yes or no".
//!
//! - [`PrecedenceResolver`] maps (team, key) identifiers onto the
//!   ordered chain of scopes that must all authorize a request.
//! - [`ReservationEngine`] places, settles, and releases holds under
//!   per-scope locking.
//! - [`ExpirySweeper`] reclaims holds abandoned by crashed requests.
//! - [`Reconciler`] audits scope balances against the reservation
//!   table and optionally heals drift.
//!
//! No component outside this crate mutates scope balances.

mod engine;
mod reconcile;
mod resolver;
mod settlement;
mod sweeper;

pub use engine::{Admission, ReservationEngine, ScopeBalance};
pub use reconcile::{ReconcileReport, Reconciler, ScopeDrift};
pub use resolver::PrecedenceResolver;
pub use settlement::Settlement;
pub use sweeper::{ExpirySweeper, SweepStats};
