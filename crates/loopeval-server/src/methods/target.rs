use super::{parse, reply, MethodContext, MethodError, MethodResult};
use loopeval_core::context::Ctx;
use loopeval_core::model::SpaceId;
use loopeval_core::storage::Page;
use loopeval_core::target::{TargetInput, TargetKind};
use serde::Deserialize;
use serde_json::Value;

pub const METHODS: &[&str] = &[
    "target.create",
    "target.get",
    "target.batch_get_by_source",
    "target.get_version",
    "target.batch_get_versions",
    "target.list_versions",
    "target.list_kinds",
    "target.list_sources",
    "target.list_source_versions",
    "target.execute",
    "target.get_record",
    "target.batch_get_records",
];

#[derive(Deserialize)]
struct ById {
    space_id: SpaceId,
    id: i64,
    #[serde(default)]
    with_source_info: bool,
}

#[derive(Deserialize)]
struct ByIds {
    space_id: SpaceId,
    ids: Vec<i64>,
    #[serde(default)]
    with_source_info: bool,
}

#[derive(Deserialize)]
struct BySource {
    space_id: SpaceId,
    kind: TargetKind,
    source_ids: Vec<String>,
}

#[derive(Deserialize)]
struct SourcesParams {
    space_id: SpaceId,
    kind: TargetKind,
    #[serde(default)]
    keyword: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    page: Page,
}

#[derive(Deserialize)]
struct ExecuteParams {
    space_id: SpaceId,
    target_version_id: i64,
    #[serde(default)]
    input: TargetInput,
}

pub async fn call(ctx: &MethodContext, rctx: &Ctx, name: &str, params: &Value) -> MethodResult {
    let svc = ctx.engine.targets();
    match name {
        "create" => reply(svc.create(rctx, parse(params)?).await?),
        "get" => {
            let p: ById = parse(params)?;
            reply(svc.get_target(p.space_id, p.id)?)
        }
        "batch_get_by_source" => {
            let p: BySource = parse(params)?;
            reply(svc.batch_get_by_source(p.space_id, p.kind, &p.source_ids)?)
        }
        "get_version" => {
            let p: ById = parse(params)?;
            reply(svc.get_version(rctx, p.space_id, p.id, p.with_source_info).await?)
        }
        "batch_get_versions" => {
            let p: ByIds = parse(params)?;
            reply(
                svc.batch_get_versions(rctx, p.space_id, &p.ids, p.with_source_info)
                    .await?,
            )
        }
        "list_versions" => {
            let p: ById = parse(params)?;
            reply(svc.list_versions(p.space_id, p.id)?)
        }
        "list_kinds" => reply(svc.registry().kinds()),
        "list_sources" => {
            let p: SourcesParams = parse(params)?;
            reply(
                svc.list_sources(rctx, p.space_id, p.kind, p.keyword.as_deref(), p.page)
                    .await?,
            )
        }
        "list_source_versions" => {
            let p: SourcesParams = parse(params)?;
            let source_id = p
                .source_id
                .ok_or_else(|| MethodError::InvalidParams("missing field `source_id`".into()))?;
            reply(
                svc.list_source_versions(rctx, p.space_id, p.kind, &source_id, p.page)
                    .await?,
            )
        }
        "execute" => {
            let p: ExecuteParams = parse(params)?;
            reply(svc.execute(rctx, p.space_id, p.target_version_id, p.input).await?)
        }
        "get_record" => {
            let p: ById = parse(params)?;
            reply(svc.get_record(p.space_id, p.id)?)
        }
        "batch_get_records" => {
            let p: ByIds = parse(params)?;
            reply(svc.batch_get_records(p.space_id, &p.ids)?)
        }
        _ => Err(MethodError::NotFound(format!("target.{}", name))),
    }
}
