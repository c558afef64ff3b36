//! Runtime configuration types re-exported next to the file-backed sections

pub use crate::paper_trading::{LedgerConfig, PyramidConfig};
pub use crate::risk::RiskConfig;
pub use crate::strategy::adaptive::AdaptiveConfig;
pub use crate::strategy::cascade::CascadeConfig;
pub use crate::strategy::selector::SelectorConfig;
