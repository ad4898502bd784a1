pub mod linalg;
pub mod model;
pub mod backtest;
pub mod registry;
pub mod experiment;
pub mod serving;

pub use model::{ForecastModel, ModelParams};
pub use backtest::{backtest, evaluate_on_tail, mean_absolute_error, split_holdout, BacktestResult};
pub use registry::{ArtifactMeta, ModelArtifact, ModelRegistry, ModelVersion};
pub use serving::ForecastError;
