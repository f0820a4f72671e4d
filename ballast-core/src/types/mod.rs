//! Domain primitives shared across the engine.

mod returns;
mod strategy;
mod weights;

pub use returns::{ReturnPoint, ReturnSeries};
pub use strategy::StrategyId;
pub use weights::{WEIGHT_SUM_TOLERANCE, WeightVector};
