mod orchestrator;
pub mod types;

pub use orchestrator::{fuse, EnsembleOrchestrator};
pub use types::{Consensus, EnsembleConfig};
