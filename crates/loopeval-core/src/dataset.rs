//! Evaluation-set collaborator. The engine only reads versions and items and,
//! for online experiments, appends items to a version.

use crate::errors::{ErrorDetail, ErrorKind, EvalError, EvalResult, ResourceKind};
use crate::idgen::{IdGenerator, SnowflakeIds};
use crate::model::{ItemId, SpaceId, TurnId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub key: String,
    pub name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub description: String,
}

fn default_content_type() -> String {
    "text".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSet {
    pub id: i64,
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schema: Vec<FieldSchema>,
    pub created_by: String,
    #[serde(default)]
    pub latest_version_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSetVersion {
    pub id: i64,
    pub eval_set_id: i64,
    pub space_id: SpaceId,
    pub version: String,
    pub schema: Vec<FieldSchema>,
    pub item_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSetItem {
    pub item_id: ItemId,
    #[serde(default)]
    pub item_key: Option<String>,
    pub turns: Vec<Turn>,
}

/// Item payload before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NewItem {
    #[serde(default)]
    pub item_key: Option<String>,
    pub turns: Vec<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub index: usize,
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

#[async_trait]
pub trait EvalSetProvider: Send + Sync {
    async fn get_version(&self, space_id: SpaceId, version_id: i64) -> EvalResult<EvalSetVersion>;

    /// Items in dataset order.
    async fn list_items(
        &self,
        space_id: SpaceId,
        version_id: i64,
        offset: usize,
        limit: usize,
    ) -> EvalResult<Vec<EvalSetItem>>;

    /// Missing ids are omitted from the result.
    async fn batch_get_items(
        &self,
        space_id: SpaceId,
        version_id: i64,
        item_ids: &[ItemId],
    ) -> EvalResult<Vec<EvalSetItem>>;

    async fn batch_create_items(
        &self,
        space_id: SpaceId,
        version_id: i64,
        items: Vec<NewItem>,
    ) -> EvalResult<Vec<ItemOutcome>>;
}

/// Collects every item of a version by paging through `list_items`.
pub async fn all_items(
    provider: &dyn EvalSetProvider,
    space_id: SpaceId,
    version_id: i64,
) -> EvalResult<Vec<EvalSetItem>> {
    const PAGE: usize = 200;
    let mut out = Vec::new();
    loop {
        let page = provider
            .list_items(space_id, version_id, out.len(), PAGE)
            .await?;
        let n = page.len();
        out.extend(page);
        if n < PAGE {
            return Ok(out);
        }
    }
}

#[derive(Default)]
struct SetState {
    set: Option<EvalSet>,
    draft: Vec<EvalSetItem>,
}

#[derive(Default)]
struct Inner {
    sets: HashMap<i64, SetState>,
    versions: HashMap<i64, (EvalSetVersion, Vec<EvalSetItem>)>,
}

/// In-process dataset service used by the CLI, the server and tests.
#[derive(Clone)]
pub struct MemoryEvalSets {
    inner: Arc<RwLock<Inner>>,
    ids: Arc<dyn IdGenerator>,
    max_turn_fields: usize,
}

impl Default for MemoryEvalSets {
    fn default() -> Self {
        Self::new(Arc::new(SnowflakeIds::new(1)))
    }
}

fn poisoned<T>(_: T) -> EvalError {
    EvalError::Internal("eval set store lock poisoned".into())
}

impl MemoryEvalSets {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            ids,
            max_turn_fields: 64,
        }
    }

    pub fn create_set(
        &self,
        space_id: SpaceId,
        name: &str,
        description: &str,
        schema: Vec<FieldSchema>,
        created_by: &str,
    ) -> EvalResult<EvalSet> {
        if name.trim().is_empty() {
            return Err(EvalError::InvalidParam("eval set name is empty".into()));
        }
        let mut g = self.inner.write().map_err(poisoned)?;
        let dup = g.sets.values().filter_map(|s| s.set.as_ref()).any(|s| s.space_id == space_id && s.name == name);
        if dup {
            return Err(EvalError::NameExists(name.to_string()));
        }
        let set = EvalSet {
            id: self.ids.next_id(),
            space_id,
            name: name.to_string(),
            description: description.to_string(),
            schema,
            created_by: created_by.to_string(),
            latest_version_id: None,
        };
        g.sets.insert(
            set.id,
            SetState {
                set: Some(set.clone()),
                draft: Vec::new(),
            },
        );
        Ok(set)
    }

    pub fn get_set(&self, space_id: SpaceId, set_id: i64) -> EvalResult<EvalSet> {
        let g = self.inner.read().map_err(poisoned)?;
        g.sets
            .get(&set_id)
            .and_then(|s| s.set.clone())
            .filter(|s| s.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))
    }

    pub fn list_sets(&self, space_id: SpaceId) -> EvalResult<Vec<EvalSet>> {
        let g = self.inner.read().map_err(poisoned)?;
        let mut out: Vec<EvalSet> = g
            .sets
            .values()
            .filter_map(|s| s.set.clone())
            .filter(|s| s.space_id == space_id)
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    pub fn update_set(
        &self,
        space_id: SpaceId,
        set_id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> EvalResult<EvalSet> {
        let mut g = self.inner.write().map_err(poisoned)?;
        if let Some(n) = name {
            let taken = g
                .sets
                .values()
                .filter_map(|s| s.set.as_ref())
                .any(|s| s.space_id == space_id && s.name == n && s.id != set_id);
            if taken {
                return Err(EvalError::NameExists(n.to_string()));
            }
        }
        let state = g
            .sets
            .get_mut(&set_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        let set = state
            .set
            .as_mut()
            .filter(|s| s.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        if let Some(n) = name {
            set.name = n.to_string();
        }
        if let Some(d) = description {
            set.description = d.to_string();
        }
        Ok(set.clone())
    }

    pub fn delete_set(&self, space_id: SpaceId, set_id: i64) -> EvalResult<()> {
        self.get_set(space_id, set_id)?;
        let mut g = self.inner.write().map_err(poisoned)?;
        g.sets.remove(&set_id);
        Ok(())
    }

    pub fn update_schema(
        &self,
        space_id: SpaceId,
        set_id: i64,
        schema: Vec<FieldSchema>,
    ) -> EvalResult<EvalSet> {
        let mut g = self.inner.write().map_err(poisoned)?;
        let set = g
            .sets
            .get_mut(&set_id)
            .and_then(|s| s.set.as_mut())
            .filter(|s| s.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        set.schema = schema;
        Ok(set.clone())
    }

    /// Snapshots the current draft into an immutable version.
    pub fn create_version(
        &self,
        space_id: SpaceId,
        set_id: i64,
        version: &str,
    ) -> EvalResult<EvalSetVersion> {
        let mut g = self.inner.write().map_err(poisoned)?;
        let taken = g
            .versions
            .values()
            .any(|(v, _)| v.eval_set_id == set_id && v.version == version);
        if taken {
            return Err(EvalError::NameExists(format!("version {}", version)));
        }
        let id = self.ids.next_id();
        let state = g
            .sets
            .get_mut(&set_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        let set = state
            .set
            .as_mut()
            .filter(|s| s.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        set.latest_version_id = Some(id);
        let v = EvalSetVersion {
            id,
            eval_set_id: set_id,
            space_id,
            version: version.to_string(),
            schema: set.schema.clone(),
            item_count: state.draft.len() as i64,
        };
        let items = state.draft.clone();
        g.versions.insert(id, (v.clone(), items));
        Ok(v)
    }

    pub fn list_versions(&self, space_id: SpaceId, set_id: i64) -> EvalResult<Vec<EvalSetVersion>> {
        let g = self.inner.read().map_err(poisoned)?;
        let mut out: Vec<EvalSetVersion> = g
            .versions
            .values()
            .map(|(v, _)| v.clone())
            .filter(|v| v.space_id == space_id && v.eval_set_id == set_id)
            .collect();
        out.sort_by_key(|v| v.id);
        Ok(out)
    }

    pub fn batch_get_versions(&self, space_id: SpaceId, ids: &[i64]) -> EvalResult<Vec<EvalSetVersion>> {
        let g = self.inner.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| g.versions.get(id))
            .map(|(v, _)| v.clone())
            .filter(|v| v.space_id == space_id)
            .collect())
    }

    fn materialize(&self, item: NewItem) -> EvalResult<EvalSetItem> {
        if item.turns.is_empty() {
            return Err(EvalError::InvalidParam("item has no turns".into()));
        }
        if item.turns.iter().any(|t| t.len() > self.max_turn_fields) {
            return Err(EvalError::InvalidParam("turn has too many fields".into()));
        }
        Ok(EvalSetItem {
            item_id: self.ids.next_id(),
            item_key: item.item_key,
            turns: item
                .turns
                .into_iter()
                .map(|fields| Turn {
                    turn_id: self.ids.next_id(),
                    fields,
                })
                .collect(),
        })
    }

    pub fn add_draft_items(
        &self,
        space_id: SpaceId,
        set_id: i64,
        items: Vec<NewItem>,
    ) -> EvalResult<Vec<ItemOutcome>> {
        self.get_set(space_id, set_id)?;
        let built: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| (index, self.materialize(item)))
            .collect();
        let mut g = self.inner.write().map_err(poisoned)?;
        let state = g
            .sets
            .get_mut(&set_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        Ok(push_outcomes(&mut state.draft, built))
    }

    pub fn update_draft_item(
        &self,
        space_id: SpaceId,
        set_id: i64,
        item_id: ItemId,
        turns: Vec<BTreeMap<String, serde_json::Value>>,
    ) -> EvalResult<EvalSetItem> {
        self.get_set(space_id, set_id)?;
        let mut g = self.inner.write().map_err(poisoned)?;
        let state = g
            .sets
            .get_mut(&set_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        let item = state
            .draft
            .iter_mut()
            .find(|i| i.item_id == item_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSetItem, item_id))?;
        item.turns = turns
            .into_iter()
            .map(|fields| Turn {
                turn_id: self.ids.next_id(),
                fields,
            })
            .collect();
        Ok(item.clone())
    }

    pub fn delete_draft_items(&self, space_id: SpaceId, set_id: i64, ids: &[ItemId]) -> EvalResult<usize> {
        self.get_set(space_id, set_id)?;
        let mut g = self.inner.write().map_err(poisoned)?;
        let state = g
            .sets
            .get_mut(&set_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSet, set_id))?;
        let before = state.draft.len();
        state.draft.retain(|i| !ids.contains(&i.item_id));
        Ok(before - state.draft.len())
    }

    pub fn list_draft_items(&self, space_id: SpaceId, set_id: i64) -> EvalResult<Vec<EvalSetItem>> {
        self.get_set(space_id, set_id)?;
        let g = self.inner.read().map_err(poisoned)?;
        Ok(g.sets.get(&set_id).map(|s| s.draft.clone()).unwrap_or_default())
    }

    pub fn clear_draft(&self, space_id: SpaceId, set_id: i64) -> EvalResult<()> {
        self.get_set(space_id, set_id)?;
        let mut g = self.inner.write().map_err(poisoned)?;
        if let Some(s) = g.sets.get_mut(&set_id) {
            s.draft.clear();
        }
        Ok(())
    }

    /// Convenience for tests and the CLI: one set, one version, the given items.
    pub fn seed(
        &self,
        space_id: SpaceId,
        name: &str,
        schema: Vec<FieldSchema>,
        items: Vec<NewItem>,
    ) -> EvalResult<(EvalSet, EvalSetVersion)> {
        let set = self.create_set(space_id, name, "", schema, "system")?;
        let outcomes = self.add_draft_items(space_id, set.id, items)?;
        if let Some(bad) = outcomes.iter().find_map(|o| o.error.clone()) {
            return Err(EvalError::InvalidParam(bad.message));
        }
        let version = self.create_version(space_id, set.id, "v1")?;
        let set = self.get_set(space_id, set.id)?;
        Ok((set, version))
    }
}

fn push_outcomes(
    dest: &mut Vec<EvalSetItem>,
    built: Vec<(usize, EvalResult<EvalSetItem>)>,
) -> Vec<ItemOutcome> {
    built
        .into_iter()
        .map(|(index, r)| match r {
            Ok(item) => {
                let id = item.item_id;
                dest.push(item);
                ItemOutcome {
                    index,
                    item_id: Some(id),
                    error: None,
                }
            }
            Err(e) => ItemOutcome {
                index,
                item_id: None,
                error: Some(ErrorDetail::new(e.kind(), e.extra())),
            },
        })
        .collect()
}

#[async_trait]
impl EvalSetProvider for MemoryEvalSets {
    async fn get_version(&self, space_id: SpaceId, version_id: i64) -> EvalResult<EvalSetVersion> {
        let g = self.inner.read().map_err(poisoned)?;
        g.versions
            .get(&version_id)
            .map(|(v, _)| v.clone())
            .filter(|v| v.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSetVersion, version_id))
    }

    async fn list_items(
        &self,
        space_id: SpaceId,
        version_id: i64,
        offset: usize,
        limit: usize,
    ) -> EvalResult<Vec<EvalSetItem>> {
        let g = self.inner.read().map_err(poisoned)?;
        let (v, items) = g
            .versions
            .get(&version_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSetVersion, version_id))?;
        if v.space_id != space_id {
            return Err(EvalError::not_found(ResourceKind::EvalSetVersion, version_id));
        }
        Ok(items.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn batch_get_items(
        &self,
        space_id: SpaceId,
        version_id: i64,
        item_ids: &[ItemId],
    ) -> EvalResult<Vec<EvalSetItem>> {
        let g = self.inner.read().map_err(poisoned)?;
        let (v, items) = g
            .versions
            .get(&version_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSetVersion, version_id))?;
        if v.space_id != space_id {
            return Err(EvalError::not_found(ResourceKind::EvalSetVersion, version_id));
        }
        Ok(item_ids
            .iter()
            .filter_map(|id| items.iter().find(|i| i.item_id == *id).cloned())
            .collect())
    }

    async fn batch_create_items(
        &self,
        space_id: SpaceId,
        version_id: i64,
        items: Vec<NewItem>,
    ) -> EvalResult<Vec<ItemOutcome>> {
        let built: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| (index, self.materialize(item)))
            .collect();
        let mut g = self.inner.write().map_err(poisoned)?;
        let (v, dest) = g
            .versions
            .get_mut(&version_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvalSetVersion, version_id))?;
        if v.space_id != space_id {
            return Err(EvalError::not_found(ResourceKind::EvalSetVersion, version_id));
        }
        let out = push_outcomes(dest, built);
        v.item_count = dest.len() as i64;
        Ok(out)
    }
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.item_id.is_some()
    }
}

/// Marker used when an item disappeared from the dataset after the experiment was created.
pub fn missing_item(item_id: ItemId) -> ErrorDetail {
    ErrorDetail::new(
        ErrorKind::NotFound,
        format!("{} {}", ResourceKind::EvalSetItem, item_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(q: &str) -> NewItem {
        let mut t = BTreeMap::new();
        t.insert("input".to_string(), json!(q));
        NewItem {
            item_key: None,
            turns: vec![t],
        }
    }

    #[tokio::test]
    async fn test_version_snapshots_draft() {
        let sets = MemoryEvalSets::default();
        let (set, v1) = sets.seed(1, "qa", vec![], vec![item("a"), item("b")]).unwrap();
        sets.add_draft_items(1, set.id, vec![item("c")]).unwrap();

        let items = all_items(&sets, 1, v1.id).await.unwrap();
        assert_eq!(items.len(), 2);
        let v2 = sets.create_version(1, set.id, "v2").unwrap();
        assert_eq!(v2.item_count, 3);
    }

    #[tokio::test]
    async fn test_batch_create_reports_per_item_errors() {
        let sets = MemoryEvalSets::default();
        let (_, v) = sets.seed(1, "qa", vec![], vec![]).unwrap();
        let out = sets
            .batch_create_items(1, v.id, vec![item("x"), NewItem::default()])
            .await
            .unwrap();
        assert!(out[0].is_ok());
        assert_eq!(out[1].error.as_ref().map(|e| e.kind), Some(ErrorKind::InvalidParam));
        assert_eq!(sets.get_version(1, v.id).await.unwrap().item_count, 1);
    }

    #[tokio::test]
    async fn test_other_space_is_not_found() {
        let sets = MemoryEvalSets::default();
        let (_, v) = sets.seed(1, "qa", vec![], vec![item("a")]).unwrap();
        let err = sets.get_version(2, v.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
