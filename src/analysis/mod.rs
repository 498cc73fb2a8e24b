//! Analysis modules.
//!
//! Turns raw job results into the rows and failure lists of a report.

pub mod aggregator;

pub use aggregator::*;
