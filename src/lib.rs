pub mod alias;
pub mod buffer;
pub mod config;
pub mod corpus;
pub mod device;
pub mod engine;
pub mod error;
pub mod logging;
pub mod matrix;
pub mod ops;
pub mod pipeline;
pub mod poisson;
pub mod trace_reporter;

pub use buffer::{Buffer, BufferId};
pub use device::{DeviceConfig, DeviceContext};
pub use engine::{Args, Engine};
pub use error::{EngineError, EngineState, Result};
pub use ops::PhiEstimator;
pub use pipeline::{SweepOptions, SweepStats, sweep};
