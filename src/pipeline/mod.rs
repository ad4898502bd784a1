pub mod evaluate;
pub mod extract;
pub mod orchestrator;
pub mod publish;
pub mod retrain;

pub use evaluate::{evaluate_prod, Evaluation, EvaluationReport};
pub use extract::{ExtractOutcome, ExtractReport, Extractor};
pub use orchestrator::{DailyPipeline, PipelineReport, Stage, StageReport};
pub use publish::{GitPublisher, PublishOutcome};
pub use retrain::{decide, PromotionDecision, RetrainLog, RetrainOutcome, RetrainReport, Retrainer};
