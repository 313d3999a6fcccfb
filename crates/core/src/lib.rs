//! # Spendgate Core
//!
//! Domain types, traits, and error definitions for the spendgate budget
//! admission ledger. This crate has **zero framework dependencies** — it
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The durable ledger is defined as a trait here (`LedgerStore`) whose
//! methods are the *atomic compound operations* of the system — placing,
//! settling, and releasing a hold — never row-level primitives. That keeps
//! the all-or-nothing guarantee behind the seam: an implementation either
//! applies a whole operation or none of it, and the engine above never has
//! to stitch partial writes together.

pub mod error;
pub mod mode;
pub mod money;
pub mod reservation;
pub mod scope;
pub mod store;
pub mod usage;

// Re-export key types at crate root for ergonomics
pub use error::{AdmissionError, Error, LedgerError, Result};
pub use mode::BudgetMode;
pub use reservation::{Reservation, ReservationStatus};
pub use scope::{BudgetScope, ScopeChain, ScopeKind, ScopeRef, ScopeSpec, period_for};
pub use store::{HoldOutcome, LedgerStore, ReleaseOutcome, SettleOutcome};
pub use usage::{TokenCountSource, UsageEvent, UsageRollup, UsageStatus};
