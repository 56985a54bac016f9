//! Environment-side implementations of the core's executor and artifact seams.

pub mod artifacts;
pub mod executor;

pub use artifacts::LocalArtifactStore;
pub use executor::SimulatedExecutor;
