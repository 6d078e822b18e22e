use super::{parse, reply, MethodContext, MethodError, MethodResult};
use loopeval_core::context::Ctx;
use loopeval_core::evaluator::service::CorrectionRequest;
use loopeval_core::evaluator::{EvaluatorDraft, EvaluatorInput, EvaluatorKind};
use loopeval_core::model::SpaceId;
use loopeval_core::storage::Page;
use serde::Deserialize;
use serde_json::Value;

pub const METHODS: &[&str] = &[
    "evaluator.create",
    "evaluator.get",
    "evaluator.batch_get",
    "evaluator.list",
    "evaluator.check_name",
    "evaluator.update",
    "evaluator.update_draft",
    "evaluator.delete",
    "evaluator.submit_version",
    "evaluator.list_versions",
    "evaluator.batch_get_versions",
    "evaluator.list_templates",
    "evaluator.get_template",
    "evaluator.debug",
    "evaluator.run",
    "evaluator.get_record",
    "evaluator.batch_get_records",
    "evaluator.update_record",
];

#[derive(Deserialize)]
struct ById {
    space_id: SpaceId,
    id: i64,
}

#[derive(Deserialize)]
struct ByIds {
    space_id: SpaceId,
    ids: Vec<i64>,
}

#[derive(Deserialize)]
struct ListParams {
    space_id: SpaceId,
    #[serde(default)]
    name_like: Option<String>,
    #[serde(default)]
    kind: Option<EvaluatorKind>,
    #[serde(default)]
    page: Page,
}

#[derive(Deserialize)]
struct CheckNameParams {
    space_id: SpaceId,
    name: String,
    #[serde(default)]
    exclude_id: Option<i64>,
}

#[derive(Deserialize)]
struct UpdateParams {
    space_id: SpaceId,
    id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct UpdateDraftParams {
    space_id: SpaceId,
    id: i64,
    draft: EvaluatorDraft,
}

#[derive(Deserialize)]
struct SubmitParams {
    space_id: SpaceId,
    id: i64,
    version: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct TemplateParams {
    #[serde(default)]
    kind: Option<EvaluatorKind>,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Deserialize)]
struct DebugParams {
    space_id: SpaceId,
    draft: EvaluatorDraft,
    #[serde(default)]
    input: EvaluatorInput,
}

#[derive(Deserialize)]
struct RunParams {
    space_id: SpaceId,
    evaluator_version_id: i64,
    #[serde(default)]
    input: EvaluatorInput,
}

#[derive(Deserialize)]
struct CorrectionParams {
    space_id: SpaceId,
    record_id: i64,
    #[serde(flatten)]
    correction: CorrectionRequest,
}

pub async fn call(ctx: &MethodContext, rctx: &Ctx, name: &str, params: &Value) -> MethodResult {
    let svc = ctx.engine.evaluators();
    match name {
        "create" => reply(svc.create(rctx, parse(params)?).await?),
        "get" => {
            let p: ById = parse(params)?;
            reply(svc.get_with_versions(p.space_id, p.id)?)
        }
        "batch_get" => {
            let p: ByIds = parse(params)?;
            reply(svc.batch_get(p.space_id, &p.ids)?)
        }
        "list" => {
            let p: ListParams = parse(params)?;
            let (evaluators, total) = svc.list(p.space_id, p.name_like.as_deref(), p.kind, p.page)?;
            reply(serde_json::json!({ "evaluators": evaluators, "total": total }))
        }
        "check_name" => {
            let p: CheckNameParams = parse(params)?;
            let available = svc.check_name(p.space_id, &p.name, p.exclude_id)?;
            reply(serde_json::json!({ "available": available }))
        }
        "update" => {
            let p: UpdateParams = parse(params)?;
            reply(svc.update(rctx, p.space_id, p.id, p.name, p.description).await?)
        }
        "update_draft" => {
            let p: UpdateDraftParams = parse(params)?;
            reply(svc.update_draft(rctx, p.space_id, p.id, p.draft).await?)
        }
        "delete" => {
            let p: ById = parse(params)?;
            svc.delete(p.space_id, p.id)?;
            reply(serde_json::json!({}))
        }
        "submit_version" => {
            let p: SubmitParams = parse(params)?;
            reply(
                svc.submit_version(rctx, p.space_id, p.id, &p.version, &p.description)
                    .await?,
            )
        }
        "list_versions" => {
            let p: ById = parse(params)?;
            reply(svc.list_versions(p.space_id, p.id)?)
        }
        "batch_get_versions" => {
            let p: ByIds = parse(params)?;
            reply(svc.batch_get_versions(p.space_id, &p.ids)?)
        }
        "list_templates" => {
            let p: TemplateParams = parse(params)?;
            reply(svc.list_templates(p.kind))
        }
        "get_template" => {
            let p: TemplateParams = parse(params)?;
            let key = p
                .key
                .ok_or_else(|| MethodError::InvalidParams("missing field `key`".into()))?;
            reply(svc.get_template(&key)?)
        }
        "debug" => {
            let p: DebugParams = parse(params)?;
            reply(svc.debug(rctx, p.space_id, p.draft, &p.input).await?)
        }
        "run" => {
            let p: RunParams = parse(params)?;
            reply(svc.run(rctx, p.space_id, p.evaluator_version_id, p.input).await?)
        }
        "get_record" => {
            let p: ById = parse(params)?;
            reply(svc.get_record(p.space_id, p.id)?)
        }
        "batch_get_records" => {
            let p: ByIds = parse(params)?;
            reply(svc.batch_get_records(p.space_id, &p.ids)?)
        }
        "update_record" => {
            let p: CorrectionParams = parse(params)?;
            reply(svc.update_record(rctx, p.space_id, p.record_id, p.correction).await?)
        }
        _ => Err(MethodError::NotFound(format!("evaluator.{}", name))),
    }
}
