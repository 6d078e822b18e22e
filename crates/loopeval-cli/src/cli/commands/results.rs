use super::{exit_codes, open_store};
use crate::cli::args::ResultsArgs;
use crate::report;
use std::collections::BTreeMap;

pub fn cmd_results(args: ResultsArgs) -> anyhow::Result<i32> {
    if !args.db.exists() {
        eprintln!("config error: no database at {}", args.db.display());
        return Ok(exit_codes::CONFIG_ERROR);
    }
    let store = open_store(&args.db)?;
    let experiment = match store.get_experiment(args.expt_id)? {
        Some(e) if e.space_id == args.space_id => e,
        _ => {
            eprintln!("experiment {} not found in space {}", args.expt_id, args.space_id);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let stats = store.get_stats(experiment.id)?;
    let aggregates = store.get_aggregates(experiment.id)?;
    let turns = store.scan_turn_results(experiment.id, None, args.limit)?;
    let names: BTreeMap<i64, String> = store
        .mget_evaluator_versions(args.space_id, &experiment.evaluator_version_ids)?
        .into_iter()
        .map(|v| (v.id, v.name))
        .collect();

    if args.format == "json" {
        let out = serde_json::json!({
            "experiment": experiment,
            "stats": stats,
            "aggregates": aggregates,
            "turns": turns,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(exit_codes::OK);
    }

    let report = report::RunReport {
        evaluators: report::summarize(&names, &BTreeMap::new(), &aggregates),
        experiment,
        stats,
        aggregates,
    };
    report::print_summary(&report);
    report::print_turns(&turns, &names);
    Ok(exit_codes::OK)
}
