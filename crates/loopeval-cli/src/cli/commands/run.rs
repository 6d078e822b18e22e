use super::{config_error, ensure_parent_dir, exit_codes, open_store};
use crate::cli::args::RunArgs;
use crate::experiment_file::{ExperimentFile, LlmProvider, LlmSpec};
use crate::report::{self, RunReport};
use loopeval_core::config::EngineConfig;
use loopeval_core::context::Ctx;
use loopeval_core::dataset::MemoryEvalSets;
use loopeval_core::engine::{Engine, EngineBuilder};
use loopeval_core::evaluator::service::CreateEvaluator;
use loopeval_core::idgen::SnowflakeIds;
use loopeval_core::manager::CreateExperiment;
use loopeval_core::model::{EvaluatorFieldMapping, ExptStatus, TargetFieldMapping};
use loopeval_core::target::service::CreateTarget;
use loopeval_core::{EvalError, EvalResult};
use loopeval_evaluators::llm::{fake::FakeLlm, openai::OpenAIClient, LlmClient, Unconfigured};
use loopeval_evaluators::targets::StaticSources;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const FAKE_FALLBACK: &str = r#"{"score": 1, "reason": "fake judge"}"#;

pub async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let file = match ExperimentFile::load(&args.file) {
        Ok(f) => f,
        Err(e) => return config_error(e),
    };
    let cfg = match &args.config {
        Some(path) => match EngineConfig::load(path, args.strict_config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e);
                return Ok(exit_codes::CONFIG_ERROR);
            }
        },
        None => EngineConfig::default(),
    }
    .with_env();

    let llm = match build_llm(&file.llm) {
        Ok(l) => l,
        Err(e) => return config_error(e),
    };

    let ids = Arc::new(SnowflakeIds::default());
    let eval_sets = Arc::new(MemoryEvalSets::new(ids.clone()));
    let set_name = file.dataset.name.clone().unwrap_or_else(|| file.name.clone());
    let (_, set_version) = eval_sets.seed(file.space_id, &set_name, file.schema(), file.items())?;

    ensure_parent_dir(&args.db)?;
    let store = open_store(&args.db)?;
    let (evaluators, targets) = loopeval_evaluators::default_registries(llm, StaticSources::new());
    let engine = EngineBuilder::new(store, cfg)
        .ids(ids)
        .eval_sets(eval_sets)
        .evaluators(evaluators)
        .targets(targets)
        .build()?;
    engine.start().await?;

    let outcome = execute(&engine, &file, set_version.id, Duration::from_secs(args.timeout_secs)).await;
    engine.shutdown().await;
    let report = match outcome {
        Ok(r) => r,
        Err(EvalError::InvalidParam(msg)) => {
            eprintln!("config error: {}", msg);
            return Ok(exit_codes::CONFIG_ERROR);
        }
        Err(e) => return Err(e.into()),
    };

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report::print_summary(&report);
    }

    if report.experiment.status == ExptStatus::Success && report.all_passed() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::EVAL_FAILED)
    }
}

fn build_llm(spec: &LlmSpec) -> anyhow::Result<Arc<dyn LlmClient>> {
    Ok(match spec.provider {
        LlmProvider::Fake => {
            let fallback = spec.fallback.clone().unwrap_or_else(|| FAKE_FALLBACK.to_string());
            let fake = spec.replies.iter().fold(FakeLlm::new(fallback), |f, r| f.reply(r.clone()));
            Arc::new(fake)
        }
        LlmProvider::Openai => {
            let mut client = OpenAIClient::from_env()?;
            if let Some(model) = &spec.model {
                client.default_model = model.clone();
            }
            if let Some(url) = &spec.base_url {
                client = client.with_base_url(url.clone());
            }
            Arc::new(client)
        }
        LlmProvider::None => Arc::new(Unconfigured),
    })
}

/// First free name of `base`, `base-2`, `base-3`... so reruns against one db work.
fn free_name(base: &str, is_free: impl Fn(&str) -> EvalResult<bool>) -> EvalResult<String> {
    if is_free(base)? {
        return Ok(base.to_string());
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if is_free(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

async fn execute(
    engine: &Engine,
    file: &ExperimentFile,
    eval_set_version_id: i64,
    timeout: Duration,
) -> EvalResult<RunReport> {
    let ctx = Ctx::system();
    let space = file.space_id;

    let (target_version_id, target_field_mapping) = match &file.target {
        Some(t) => {
            let created = engine
                .targets()
                .create(
                    &ctx,
                    CreateTarget {
                        space_id: space,
                        kind: t.kind,
                        source_id: t.source_id.clone(),
                        source_version: t.source_version.clone(),
                        config: t.config.clone(),
                    },
                )
                .await?;
            let mapping = TargetFieldMapping {
                from_eval_set: t.field_mapping.clone(),
            };
            (Some(created.target_version_id), mapping)
        }
        None => (None, TargetFieldMapping::default()),
    };

    let mut names = BTreeMap::new();
    let mut version_ids = Vec::new();
    let mut mappings = Vec::new();
    for spec in &file.evaluators {
        let draft = spec.draft().map_err(|e| EvalError::InvalidParam(e.to_string()))?;
        let svc = engine.evaluators();
        let name = free_name(&spec.name, |n| svc.check_name(space, n, None))?;
        let evaluator = svc
            .create(
                &ctx,
                CreateEvaluator {
                    space_id: space,
                    name,
                    description: spec.description.clone(),
                    draft,
                },
            )
            .await?;
        let version = svc.submit_version(&ctx, space, evaluator.id, "v1", "").await?;
        if !spec.from_eval_set.is_empty() || !spec.from_target.is_empty() {
            mappings.push(EvaluatorFieldMapping {
                evaluator_version_id: version.id,
                from_eval_set: spec.from_eval_set.clone(),
                from_target: spec.from_target.clone(),
            });
        }
        names.insert(version.id, spec.name.clone());
        version_ids.push(version.id);
    }

    let manager = engine.manager();
    let name = free_name(&file.name, |n| manager.check_name(space, n, None))?;
    let (expt, _) = manager
        .submit(
            &ctx,
            CreateExperiment {
                space_id: space,
                name,
                description: file.description.clone(),
                expt_type: Default::default(),
                source_type: Default::default(),
                source_id: None,
                max_alive_time_ms: file.max_alive_time_ms,
                item_concurrency: file.item_concurrency,
                evaluator_concurrency: file.evaluator_concurrency,
                eval_set_version_id,
                target_version_id,
                evaluator_version_ids: version_ids,
                target_field_mapping,
                evaluator_field_mapping: mappings,
            },
        )
        .await?;
    tracing::info!(event = "cli.submitted", expt_id = expt.id, items = file.dataset.items.len());

    let (experiment, aggregates) = engine.wait_for_aggregates(space, expt.id, timeout).await?;
    let stats = engine.store().get_stats(experiment.id)?;
    let evaluators = report::summarize(&names, &file.thresholds, &aggregates);
    Ok(RunReport {
        experiment,
        stats,
        evaluators,
        aggregates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_name_suffixes_taken_names() {
        let taken = ["smoke", "smoke-2"];
        let name = free_name("smoke", |n| Ok(!taken.contains(&n))).unwrap();
        assert_eq!(name, "smoke-3");
        assert_eq!(free_name("fresh", |_| Ok(true)).unwrap(), "fresh");
    }
}
