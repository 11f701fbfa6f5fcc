//! Parameter search and walk-forward analysis for Quantback.
//!
//! Provides the parameter space (grid and seeded random sampling), the
//! objective functions computed from backtest results, per-trial execution
//! against a coordinator, and rolling/expanding walk-forward evaluation.

pub mod metrics;
pub mod objective;
pub mod runner;
pub mod search;
pub mod trial;
pub mod walkforward;

pub use metrics::*;
pub use objective::*;
pub use runner::*;
pub use search::*;
pub use trial::*;
pub use walkforward::*;
