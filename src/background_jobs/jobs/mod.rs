//! Concrete [`BackgroundJob`](super::BackgroundJob) implementations.

pub mod simulated;

pub use simulated::SimulatedJob;
