mod staple;
pub mod types;

pub use staple::staple;
pub use types::{FusionError, StapleConfig, StapleOutcome};
