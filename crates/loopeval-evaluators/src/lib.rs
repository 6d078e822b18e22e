use std::sync::Arc;

use loopeval_core::evaluator::EvaluatorRegistry;
use loopeval_core::target::TargetRegistry;

pub mod code;
pub mod judge;
pub mod llm;
pub mod render;
pub mod targets;

use llm::LlmClient;
use targets::{HttpTarget, PromptTarget, StaticSources, TemplateTarget, TraceReplayTarget};

/// Every built-in evaluator and target kind, sharing one LLM client.
pub fn default_registries(llm: Arc<dyn LlmClient>, sources: StaticSources) -> (EvaluatorRegistry, TargetRegistry) {
    let evaluators = EvaluatorRegistry::new()
        .with(Arc::new(judge::PromptEvaluator::new(llm.clone())))
        .with(Arc::new(code::RuleEvaluator));
    let targets = TargetRegistry::new()
        .with(Arc::new(PromptTarget::new(llm, sources.clone())))
        .with(Arc::new(HttpTarget::bot(sources.clone())))
        .with(Arc::new(HttpTarget::workflow(sources.clone())))
        .with(Arc::new(TraceReplayTarget::new(sources)))
        .with(Arc::new(TemplateTarget));
    (evaluators, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopeval_core::evaluator::EvaluatorKind;
    use loopeval_core::target::TargetKind;

    #[test]
    fn test_default_registries_cover_every_kind() {
        let (evaluators, targets) = default_registries(Arc::new(llm::fake::FakeLlm::new("{}")), StaticSources::new());
        assert!(evaluators.get(EvaluatorKind::Prompt).is_ok());
        assert!(evaluators.get(EvaluatorKind::Code).is_ok());
        assert_eq!(
            targets.kinds(),
            vec![
                TargetKind::Code,
                TargetKind::CozeBot,
                TargetKind::CozeWorkflow,
                TargetKind::LoopPrompt,
                TargetKind::TraceCallback,
            ]
        );
    }
}
