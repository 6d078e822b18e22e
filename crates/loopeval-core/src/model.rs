use crate::errors::ErrorDetail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ExptId = i64;
pub type SpaceId = i64;
pub type RunId = i64;
pub type ItemId = i64;
pub type TurnId = i64;
pub type EvaluatorId = i64;
pub type EvaluatorVersionId = i64;
pub type TargetId = i64;
pub type TargetVersionId = i64;
pub type RecordId = i64;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExptStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Terminated,
    Drained,
}

impl ExptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExptStatus::Pending => "pending",
            ExptStatus::Processing => "processing",
            ExptStatus::Success => "success",
            ExptStatus::Failed => "failed",
            ExptStatus::Terminated => "terminated",
            ExptStatus::Drained => "drained",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExptStatus::Pending),
            "processing" => Some(ExptStatus::Processing),
            "success" => Some(ExptStatus::Success),
            "failed" => Some(ExptStatus::Failed),
            "terminated" => Some(ExptStatus::Terminated),
            "drained" => Some(ExptStatus::Drained),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExptStatus::Success | ExptStatus::Failed | ExptStatus::Terminated | ExptStatus::Drained
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExptType {
    #[default]
    Offline,
    Online,
}

impl ExptType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExptType::Offline => "offline",
            ExptType::Online => "online",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(ExptType::Offline),
            "online" => Some(ExptType::Online),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    Submit,
    FailRetry,
    Invoke,
}

impl EvalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalMode::Submit => "submit",
            EvalMode::FailRetry => "fail_retry",
            EvalMode::Invoke => "invoke",
        }
    }

    /// Mode of a plain run: offline experiments submit, online ones invoke.
    pub fn default_for(t: ExptType) -> Self {
        match t {
            ExptType::Offline => EvalMode::Submit,
            ExptType::Online => EvalMode::Invoke,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submit" => Some(EvalMode::Submit),
            "fail_retry" => Some(EvalMode::FailRetry),
            "invoke" => Some(EvalMode::Invoke),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Evaluation,
    AutoTask,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Evaluation => "evaluation",
            SourceType::AutoTask => "auto_task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "evaluation" => Some(SourceType::Evaluation),
            "auto_task" => Some(SourceType::AutoTask),
            _ => None,
        }
    }
}

/// State of an item or a turn within one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Processing,
    Success,
    Failed,
    Terminated,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Processing => "processing",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunState::Pending),
            "processing" => Some(RunState::Processing),
            "success" => Some(RunState::Success),
            "failed" => Some(RunState::Failed),
            "terminated" => Some(RunState::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Success | RunState::Failed | RunState::Terminated
        )
    }
}

/// One mapped input field. `from_field_name` reads a (dotted) path from the
/// source object; `const_value` is used verbatim when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldMapping {
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetFieldMapping {
    #[serde(default)]
    pub from_eval_set: Vec<FieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorFieldMapping {
    pub evaluator_version_id: EvaluatorVersionId,
    #[serde(default)]
    pub from_eval_set: Vec<FieldMapping>,
    #[serde(default)]
    pub from_target: Vec<FieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExptId,
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    pub status: ExptStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    pub expt_type: ExptType,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_id: Option<String>,
    /// Wall-clock budget for the whole experiment; 0 means unbounded.
    pub max_alive_time_ms: i64,
    pub item_concurrency: u32,
    pub evaluator_concurrency: u32,
    pub eval_set_id: i64,
    pub eval_set_version_id: i64,
    #[serde(default)]
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub target_version_id: Option<TargetVersionId>,
    pub evaluator_version_ids: Vec<EvaluatorVersionId>,
    #[serde(default)]
    pub target_field_mapping: TargetFieldMapping,
    #[serde(default)]
    pub evaluator_field_mapping: Vec<EvaluatorFieldMapping>,
    #[serde(default)]
    pub latest_run_id: Option<RunId>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Experiment {
    pub fn mapping_for(&self, evaluator_version_id: EvaluatorVersionId) -> Option<&EvaluatorFieldMapping> {
        self.evaluator_field_mapping
            .iter()
            .find(|m| m.evaluator_version_id == evaluator_version_id)
    }

    /// Deadline in epoch millis, if the experiment is time-bounded and started.
    pub fn deadline_ms(&self) -> Option<i64> {
        if self.max_alive_time_ms <= 0 {
            return None;
        }
        self.start_at.map(|s| s + self.max_alive_time_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorRef {
    pub evaluator_id: EvaluatorId,
    pub evaluator_version_id: EvaluatorVersionId,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_id: TargetId,
    pub target_version_id: TargetVersionId,
    pub kind: String,
    pub source_id: String,
    pub source_version: String,
}

/// Experiment joined with its target and evaluator references and stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDetail {
    pub experiment: Experiment,
    #[serde(default)]
    pub target: Option<TargetRef>,
    pub evaluators: Vec<EvaluatorRef>,
    #[serde(default)]
    pub stats: Option<ExptStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub expt_id: ExptId,
    pub run_id: RunId,
    pub mode: EvalMode,
    pub status: ExptStatus,
    #[serde(default)]
    pub item_ids: Vec<ItemId>,
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    pub item_id: ItemId,
    pub item_idx: i64,
    pub run_state: RunState,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    pub retry_count: u32,
    pub updated_at: i64,
}

/// One row of item run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTransition {
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub run_id: Option<RunId>,
    pub from: RunState,
    pub to: RunState,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub score: f64,
    #[serde(default)]
    pub explain: Option<String>,
    pub updated_by: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluatorCell {
    #[serde(default)]
    pub record_id: Option<RecordId>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub correction: Option<Correction>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

impl EvaluatorCell {
    /// Corrected score wins over the raw score.
    pub fn effective_score(&self) -> Option<f64> {
        match &self.correction {
            Some(c) => Some(c.score),
            None => self.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub turn_idx: i64,
    pub run_id: RunId,
    pub status: RunState,
    #[serde(default)]
    pub target_output_ref: Option<RecordId>,
    #[serde(default)]
    pub target_error: Option<ErrorDetail>,
    #[serde(default)]
    pub evaluator_results: BTreeMap<EvaluatorVersionId, EvaluatorCell>,
    pub updated_at: i64,
}

impl TurnResult {
    pub fn is_success(&self) -> bool {
        self.status == RunState::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExptStats {
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    pub pending_cnt: i64,
    pub processing_cnt: i64,
    pub success_cnt: i64,
    pub failed_cnt: i64,
    pub terminated_cnt: i64,
    pub total_cnt: i64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

impl ExptStats {
    pub fn counted(&self) -> i64 {
        self.pending_cnt + self.processing_cnt + self.success_cnt + self.failed_cnt + self.terminated_cnt
    }

    pub fn unfinished(&self) -> i64 {
        self.pending_cnt + self.processing_cnt
    }
}

/// Signed change applied to `ExptStats` in the same transaction as the row it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsDelta {
    pub pending: i64,
    pub processing: i64,
    pub success: i64,
    pub failed: i64,
    pub terminated: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl StatsDelta {
    pub fn transition(from: RunState, to: RunState) -> Self {
        let mut d = StatsDelta::default();
        if from == to {
            return d;
        }
        *d.slot(from) -= 1;
        *d.slot(to) += 1;
        d
    }

    pub fn tokens(input: i64, output: i64) -> Self {
        StatsDelta {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == StatsDelta::default()
    }

    fn slot(&mut self, s: RunState) -> &mut i64 {
        match s {
            RunState::Pending => &mut self.pending,
            RunState::Processing => &mut self.processing,
            RunState::Success => &mut self.success,
            RunState::Failed => &mut self.failed,
            RunState::Terminated => &mut self.terminated,
        }
    }

    pub fn add(mut self, other: StatsDelta) -> Self {
        self.pending += other.pending;
        self.processing += other.processing;
        self.success += other.success;
        self.failed += other.failed;
        self.terminated += other.terminated;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn add(self, other: TokenUsage) -> Self {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }

    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Outcome of a persisted target or evaluator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RecordStatus::Success),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorType {
    Average,
    Distribution,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub value: String,
    pub count: i64,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateData {
    Value { value: Option<f64>, count: i64 },
    Distribution { buckets: Vec<ScoreBucket> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorResult {
    pub aggregator_type: AggregatorType,
    pub data: AggregateData,
}

impl AggregatorResult {
    pub fn value(&self) -> Option<f64> {
        match &self.data {
            AggregateData::Value { value, .. } => *value,
            AggregateData::Distribution { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptAggregateResult {
    pub expt_id: ExptId,
    pub evaluator_version_id: EvaluatorVersionId,
    pub results: Vec<AggregatorResult>,
    pub updated_at: i64,
}

impl ExptAggregateResult {
    pub fn get(&self, t: AggregatorType) -> Option<&AggregatorResult> {
        self.results.iter().find(|r| r.aggregator_type == t)
    }
}
