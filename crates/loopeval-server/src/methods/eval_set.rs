use super::{parse, reply, MethodContext, MethodError, MethodResult};
use loopeval_core::context::Ctx;
use loopeval_core::dataset::{EvalSetProvider, FieldSchema, NewItem};
use loopeval_core::model::{ItemId, SpaceId};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const METHODS: &[&str] = &[
    "eval_set.create",
    "eval_set.get",
    "eval_set.list",
    "eval_set.update",
    "eval_set.delete",
    "eval_set.update_schema",
    "eval_set.create_version",
    "eval_set.list_versions",
    "eval_set.batch_get_versions",
    "eval_set.batch_create_items",
    "eval_set.update_item",
    "eval_set.delete_items",
    "eval_set.list_items",
    "eval_set.batch_get_items",
    "eval_set.clear_draft",
];

#[derive(Deserialize)]
struct SpaceOnly {
    space_id: SpaceId,
}

#[derive(Deserialize)]
struct BySet {
    space_id: SpaceId,
    eval_set_id: i64,
}

#[derive(Deserialize)]
struct CreateParams {
    space_id: SpaceId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    schema: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct UpdateParams {
    space_id: SpaceId,
    eval_set_id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct SchemaParams {
    space_id: SpaceId,
    eval_set_id: i64,
    schema: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct VersionParams {
    space_id: SpaceId,
    eval_set_id: i64,
    version: String,
}

#[derive(Deserialize)]
struct VersionIds {
    space_id: SpaceId,
    ids: Vec<i64>,
}

#[derive(Deserialize)]
struct ItemsParams {
    space_id: SpaceId,
    eval_set_id: i64,
    items: Vec<NewItem>,
}

#[derive(Deserialize)]
struct UpdateItemParams {
    space_id: SpaceId,
    eval_set_id: i64,
    item_id: ItemId,
    turns: Vec<BTreeMap<String, Value>>,
}

#[derive(Deserialize)]
struct ItemIdsParams {
    space_id: SpaceId,
    eval_set_id: i64,
    item_ids: Vec<ItemId>,
}

/// Draft items when only `eval_set_id` is given, a frozen version's items
/// when `version_id` is given.
#[derive(Deserialize)]
struct ListItemsParams {
    space_id: SpaceId,
    #[serde(default)]
    eval_set_id: Option<i64>,
    #[serde(default)]
    version_id: Option<i64>,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Deserialize)]
struct VersionItemsParams {
    space_id: SpaceId,
    version_id: i64,
    item_ids: Vec<ItemId>,
}

pub async fn call(ctx: &MethodContext, rctx: &Ctx, name: &str, params: &Value) -> MethodResult {
    let sets = &ctx.eval_sets;
    match name {
        "create" => {
            let p: CreateParams = parse(params)?;
            reply(sets.create_set(p.space_id, &p.name, &p.description, p.schema, rctx.user())?)
        }
        "get" => {
            let p: BySet = parse(params)?;
            reply(sets.get_set(p.space_id, p.eval_set_id)?)
        }
        "list" => {
            let p: SpaceOnly = parse(params)?;
            reply(sets.list_sets(p.space_id)?)
        }
        "update" => {
            let p: UpdateParams = parse(params)?;
            reply(sets.update_set(
                p.space_id,
                p.eval_set_id,
                p.name.as_deref(),
                p.description.as_deref(),
            )?)
        }
        "delete" => {
            let p: BySet = parse(params)?;
            sets.delete_set(p.space_id, p.eval_set_id)?;
            reply(serde_json::json!({}))
        }
        "update_schema" => {
            let p: SchemaParams = parse(params)?;
            reply(sets.update_schema(p.space_id, p.eval_set_id, p.schema)?)
        }
        "create_version" => {
            let p: VersionParams = parse(params)?;
            reply(sets.create_version(p.space_id, p.eval_set_id, &p.version)?)
        }
        "list_versions" => {
            let p: BySet = parse(params)?;
            reply(sets.list_versions(p.space_id, p.eval_set_id)?)
        }
        "batch_get_versions" => {
            let p: VersionIds = parse(params)?;
            reply(sets.batch_get_versions(p.space_id, &p.ids)?)
        }
        "batch_create_items" => {
            let p: ItemsParams = parse(params)?;
            reply(sets.add_draft_items(p.space_id, p.eval_set_id, p.items)?)
        }
        "update_item" => {
            let p: UpdateItemParams = parse(params)?;
            reply(sets.update_draft_item(p.space_id, p.eval_set_id, p.item_id, p.turns)?)
        }
        "delete_items" => {
            let p: ItemIdsParams = parse(params)?;
            let deleted = sets.delete_draft_items(p.space_id, p.eval_set_id, &p.item_ids)?;
            reply(serde_json::json!({ "deleted": deleted }))
        }
        "list_items" => {
            let p: ListItemsParams = parse(params)?;
            match (p.version_id, p.eval_set_id) {
                (Some(v), _) => reply(sets.list_items(p.space_id, v, p.offset, p.limit).await?),
                (None, Some(set)) => {
                    let items: Vec<_> = sets
                        .list_draft_items(p.space_id, set)?
                        .into_iter()
                        .skip(p.offset)
                        .take(p.limit)
                        .collect();
                    reply(items)
                }
                (None, None) => Err(MethodError::InvalidParams(
                    "one of `version_id` or `eval_set_id` is required".into(),
                )),
            }
        }
        "batch_get_items" => {
            let p: VersionItemsParams = parse(params)?;
            reply(sets.batch_get_items(p.space_id, p.version_id, &p.item_ids).await?)
        }
        "clear_draft" => {
            let p: BySet = parse(params)?;
            sets.clear_draft(p.space_id, p.eval_set_id)?;
            reply(serde_json::json!({}))
        }
        _ => Err(MethodError::NotFound(format!("eval_set.{}", name))),
    }
}
