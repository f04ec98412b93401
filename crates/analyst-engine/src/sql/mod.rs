//! SQL-backed Source and Destination
//!
//! Both adapters get their connection from a shared
//! [`DriverManager`](analyst_rdbc::driver::DriverManager), so stages that
//! name the same driver and connection string reuse one handle.

mod destination;
mod source;

pub use destination::{SqlDestination, SqlDestinationConfig};
pub use source::{SqlSource, SqlSourceConfig};
