//! Durable ledger storage for spendgate.
//!
//! One backend today: SQLite via sqlx. Every compound operation of the
//! `LedgerStore` trait runs inside a single transaction, so a crash or
//! conflict can never leave a hold applied to one scope but not the
//! other.

mod sqlite;

pub use sqlite::SqliteLedger;
