//! Request/response surface of the experiment service.
//!
//! Every request carries the workspace (`space_id`); the caller session comes
//! from the [`Ctx`]. Transports deserialize params straight into these types.

use crate::context::Ctx;
use crate::dataset::NewItem;
use crate::errors::{EvalError, EvalResult};
use crate::manager::{CreateExperiment, ExperimentManager, InvokeResult};
use crate::model::{EvalMode, Experiment, ExperimentDetail, ExptId, ExptStats, RunLog, SpaceId};
use crate::result_view::{BatchGetResultRequest, BatchGetResultResponse, ExperimentAggregates, ResultView};
use crate::storage::{ExptFilter, OrderBy, Page};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_BATCH_IDS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptRef {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptRefs {
    pub space_id: SpaceId,
    pub expt_ids: Vec<ExptId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckNameRequest {
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub exclude_id: Option<ExptId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckNameResponse {
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListExperimentsRequest {
    pub space_id: SpaceId,
    #[serde(default)]
    pub filter: ExptFilter,
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(default)]
    pub page: Page,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListExperimentsResponse {
    pub experiments: Vec<Experiment>,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateExperimentRequest {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub experiment: Experiment,
    pub run: RunLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunExperimentRequest {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    #[serde(default)]
    pub mode: Option<EvalMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeExperimentRequest {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub items: Vec<NewItem>,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: Vec<ExptId>,
}

fn check_batch(ids: &[ExptId]) -> EvalResult<()> {
    if ids.is_empty() {
        return Err(EvalError::InvalidParam("expt_ids must not be empty".into()));
    }
    if ids.len() > MAX_BATCH_IDS {
        return Err(EvalError::InvalidParam(format!(
            "at most {} experiments per batch, got {}",
            MAX_BATCH_IDS,
            ids.len()
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ExperimentService {
    manager: ExperimentManager,
    results: ResultView,
}

impl ExperimentService {
    pub fn new(manager: ExperimentManager, results: ResultView) -> Self {
        Self { manager, results }
    }

    pub async fn create(&self, ctx: &Ctx, req: CreateExperiment) -> EvalResult<Experiment> {
        self.manager.create(ctx, req).await
    }

    pub async fn submit(&self, ctx: &Ctx, req: CreateExperiment) -> EvalResult<SubmitResponse> {
        let (experiment, run) = self.manager.submit(ctx, req).await?;
        Ok(SubmitResponse { experiment, run })
    }

    pub fn check_name(&self, req: &CheckNameRequest) -> EvalResult<CheckNameResponse> {
        let available = self.manager.check_name(req.space_id, &req.name, req.exclude_id)?;
        Ok(CheckNameResponse { available })
    }

    pub fn batch_get(&self, req: &ExptRefs) -> EvalResult<Vec<ExperimentDetail>> {
        check_batch(&req.expt_ids)?;
        self.manager.mget_detail(req.space_id, &req.expt_ids)
    }

    pub fn list(&self, req: &ListExperimentsRequest) -> EvalResult<ListExperimentsResponse> {
        if req.page.limit == 0 || req.page.limit > MAX_BATCH_IDS {
            return Err(EvalError::InvalidParam(format!(
                "page limit must be within [1, {}]",
                MAX_BATCH_IDS
            )));
        }
        let (experiments, total) = self.manager.list(req.space_id, &req.filter, req.order_by, req.page)?;
        Ok(ListExperimentsResponse { experiments, total })
    }

    pub fn list_stats(&self, req: &ExptRefs) -> EvalResult<Vec<ExptStats>> {
        check_batch(&req.expt_ids)?;
        self.manager.list_stats(req.space_id, &req.expt_ids)
    }

    pub async fn update(&self, ctx: &Ctx, req: UpdateExperimentRequest) -> EvalResult<Experiment> {
        self.manager
            .update(ctx, req.space_id, req.expt_id, req.name, req.description)
            .await
    }

    pub async fn delete(&self, ctx: &Ctx, req: &ExptRef) -> EvalResult<()> {
        self.manager.delete(ctx, req.space_id, req.expt_id).await
    }

    pub async fn batch_delete(&self, ctx: &Ctx, req: &ExptRefs) -> EvalResult<DeletedResponse> {
        check_batch(&req.expt_ids)?;
        let deleted = self.manager.mdelete(ctx, req.space_id, &req.expt_ids).await?;
        Ok(DeletedResponse { deleted })
    }

    pub async fn clone_experiment(&self, ctx: &Ctx, req: &ExptRef) -> EvalResult<Experiment> {
        self.manager.clone_experiment(ctx, req.space_id, req.expt_id).await
    }

    /// Mode defaults to `Submit` for offline and `Invoke` for online experiments.
    pub async fn run(&self, ctx: &Ctx, req: &RunExperimentRequest) -> EvalResult<RunLog> {
        let mode = match req.mode {
            Some(m) => m,
            None => {
                let e = self.manager.get(req.space_id, req.expt_id)?;
                EvalMode::default_for(e.expt_type)
            }
        };
        self.manager.run(ctx, req.space_id, req.expt_id, mode).await
    }

    pub async fn retry(&self, ctx: &Ctx, req: &ExptRef) -> EvalResult<RunLog> {
        self.manager.retry_unsuccess(ctx, req.space_id, req.expt_id).await
    }

    pub async fn kill(&self, ctx: &Ctx, req: &ExptRef) -> EvalResult<Experiment> {
        self.manager.kill(ctx, req.space_id, req.expt_id).await
    }

    pub async fn invoke(&self, ctx: &Ctx, req: InvokeExperimentRequest) -> EvalResult<InvokeResult> {
        self.manager
            .invoke(ctx, req.space_id, req.expt_id, req.items, req.ext)
            .await
    }

    pub async fn finish(&self, ctx: &Ctx, req: &ExptRef) -> EvalResult<Experiment> {
        self.manager.finish(ctx, req.space_id, req.expt_id).await
    }

    pub async fn batch_get_results(&self, req: &BatchGetResultRequest) -> EvalResult<BatchGetResultResponse> {
        check_batch(&req.expt_ids)?;
        self.results.batch_get_results(req).await
    }

    pub fn batch_get_aggregates(&self, req: &ExptRefs) -> EvalResult<Vec<ExperimentAggregates>> {
        check_batch(&req.expt_ids)?;
        self.results.batch_get_aggregates(req.space_id, &req.expt_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_bounds() {
        assert!(matches!(check_batch(&[]), Err(EvalError::InvalidParam(_))));
        assert!(check_batch(&[1, 2]).is_ok());
        let many: Vec<ExptId> = (0..=MAX_BATCH_IDS as i64).collect();
        assert!(matches!(check_batch(&many), Err(EvalError::InvalidParam(_))));
    }

    #[test]
    fn test_list_request_defaults() {
        let req: ListExperimentsRequest = serde_json::from_str(r#"{"space_id": 7}"#).unwrap();
        assert_eq!(req.space_id, 7);
        assert_eq!(req.page, Page::default());
        assert!(req.filter.statuses.is_empty());
    }
}
