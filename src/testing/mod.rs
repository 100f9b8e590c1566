//! Testing utilities
//!
//! An in-memory broker driver for exercising the worker without a running
//! broker.

pub mod mocks;

pub use mocks::*;
