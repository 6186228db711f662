//! Background tasks.

pub mod expiry_sweep;

pub use expiry_sweep::{start_expiry_sweep, ExpirySweepConfig};
