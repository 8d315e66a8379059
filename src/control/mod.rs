//! Control Module
//!
//! Leaf controllers of the supervisory loop:
//! - Drift controller (per agent)
//! - Admission controller (shared across agents)

pub mod admission;
pub mod drift;

pub use admission::{AdmissionController, AdmissionError, AdmissionPermit};
pub use drift::{DriftController, DriftStatus};
