//! Built-in node processors.

pub mod arbitrated;
pub mod output;
pub mod root;
pub mod stage;

pub use arbitrated::ArbitratedNode;
pub use output::OutputNode;
pub use root::RootNode;
pub use stage::{StageFn, StageNode};
