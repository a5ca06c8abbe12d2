mod command;
mod evaluator;
mod params;
#[cfg(test)]
mod tests;

pub use command::CommandEvaluationService;
pub use evaluator::{
    CheckpointEvaluator, EvaluationRequest, EvaluationResult, EvaluationService, ModelInstance,
};
pub use params::LoadedCheckpoint;
