//! Domain layer - Node record types and the persistence port
//!
//! This module defines the record shapes and the `NodeStore` trait that
//! storage adapters implement.

pub mod ports;

pub use ports::*;
