use super::{parse, reply, MethodContext, MethodError, MethodResult};
use loopeval_core::context::Ctx;
use loopeval_core::service::{ExptRef, ExptRefs};
use serde_json::Value;

pub const METHODS: &[&str] = &[
    "experiment.create",
    "experiment.submit",
    "experiment.check_name",
    "experiment.batch_get",
    "experiment.list",
    "experiment.list_stats",
    "experiment.update",
    "experiment.delete",
    "experiment.batch_delete",
    "experiment.clone",
    "experiment.run",
    "experiment.retry",
    "experiment.kill",
    "experiment.invoke",
    "experiment.finish",
    "experiment.batch_get_results",
    "experiment.batch_get_aggregates",
];

pub async fn call(ctx: &MethodContext, rctx: &Ctx, name: &str, params: &Value) -> MethodResult {
    let svc = ctx.engine.experiments();
    match name {
        "create" => reply(svc.create(rctx, parse(params)?).await?),
        "submit" => reply(svc.submit(rctx, parse(params)?).await?),
        "check_name" => reply(svc.check_name(&parse(params)?)?),
        "batch_get" => reply(svc.batch_get(&parse::<ExptRefs>(params)?)?),
        "list" => reply(svc.list(&parse(params)?)?),
        "list_stats" => reply(svc.list_stats(&parse::<ExptRefs>(params)?)?),
        "update" => reply(svc.update(rctx, parse(params)?).await?),
        "delete" => {
            svc.delete(rctx, &parse::<ExptRef>(params)?).await?;
            reply(serde_json::json!({}))
        }
        "batch_delete" => reply(svc.batch_delete(rctx, &parse::<ExptRefs>(params)?).await?),
        "clone" => reply(svc.clone_experiment(rctx, &parse::<ExptRef>(params)?).await?),
        "run" => reply(svc.run(rctx, &parse(params)?).await?),
        "retry" => reply(svc.retry(rctx, &parse::<ExptRef>(params)?).await?),
        "kill" => reply(svc.kill(rctx, &parse::<ExptRef>(params)?).await?),
        "invoke" => reply(svc.invoke(rctx, parse(params)?).await?),
        "finish" => reply(svc.finish(rctx, &parse::<ExptRef>(params)?).await?),
        "batch_get_results" => reply(svc.batch_get_results(&parse(params)?).await?),
        "batch_get_aggregates" => reply(svc.batch_get_aggregates(&parse::<ExptRefs>(params)?)?),
        _ => Err(MethodError::NotFound(format!("experiment.{}", name))),
    }
}
