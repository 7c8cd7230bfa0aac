//! Core domain types shared across the wharf workload orchestration engine.

pub mod crd;
pub mod descriptor;
mod error;
pub mod models;
pub mod plan;
pub mod procfile;

pub use error::PlatformError;
