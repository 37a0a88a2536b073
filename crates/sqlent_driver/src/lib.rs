//! # sqlent driver
//!
//! Thin adapter between the sqlent entity manager and the embedded SQLite
//! engine. This crate is the manager's sole downward dependency:
//!
//! - [`Driver`] wraps one connection and exposes exec, cached prepared
//!   statements with positional or named binding, and last-insert-rowid.
//! - [`Value`] is the dynamic value type used for binding, fetching, and
//!   cache keys.
//! - [`DriverError::is_busy`] classifies BUSY/LOCKED so the entity layer can
//!   apply its retry policy.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod value;

pub use connection::Driver;
pub use error::{DriverError, DriverResult};
pub use value::Value;
