//! Protocol artifacts: one-time handles exchanged for protocol messages.

pub mod store;
pub mod types;

pub use store::ArtifactStore;
pub use types::{generate_artifact, ArtifactMapEntry};
