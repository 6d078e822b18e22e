pub const SCHEMA_VERSION: i64 = 2;

pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
  id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  created_by TEXT NOT NULL,
  status TEXT NOT NULL,
  status_message TEXT,
  expt_type TEXT NOT NULL,
  source_type TEXT NOT NULL,
  source_id TEXT,
  max_alive_time_ms INTEGER NOT NULL DEFAULT 0,
  item_concurrency INTEGER NOT NULL,
  evaluator_concurrency INTEGER NOT NULL,
  eval_set_id INTEGER NOT NULL,
  eval_set_version_id INTEGER NOT NULL,
  target_id INTEGER,
  target_version_id INTEGER,
  evaluator_version_ids_json TEXT NOT NULL,
  target_field_mapping_json TEXT NOT NULL,
  evaluator_field_mapping_json TEXT NOT NULL,
  latest_run_id INTEGER,
  start_at INTEGER,
  end_at INTEGER,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  version INTEGER NOT NULL DEFAULT 1,
  deleted_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_experiments_space_name
  ON experiments(space_id, name) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_experiments_space_status ON experiments(space_id, status);

CREATE TABLE IF NOT EXISTS expt_evaluator_refs (
  expt_id INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  evaluator_id INTEGER NOT NULL,
  evaluator_version_id INTEGER NOT NULL,
  PRIMARY KEY (expt_id, evaluator_version_id)
);

CREATE TABLE IF NOT EXISTS expt_run_logs (
  expt_id INTEGER NOT NULL,
  run_id INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  mode TEXT NOT NULL,
  status TEXT NOT NULL,
  item_ids_json TEXT NOT NULL DEFAULT '[]',
  started_at INTEGER NOT NULL,
  finished_at INTEGER,
  message TEXT,
  PRIMARY KEY (expt_id, run_id)
);

CREATE TABLE IF NOT EXISTS item_results (
  expt_id INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  item_idx INTEGER NOT NULL,
  run_state TEXT NOT NULL,
  run_id INTEGER,
  error_json TEXT,
  retry_count INTEGER NOT NULL DEFAULT 0,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (expt_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_item_results_state ON item_results(expt_id, run_state);

CREATE TABLE IF NOT EXISTS item_run_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  expt_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  run_id INTEGER,
  from_state TEXT NOT NULL,
  to_state TEXT NOT NULL,
  at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_item_run_logs_item ON item_run_logs(expt_id, item_id);

CREATE TABLE IF NOT EXISTS turn_results (
  expt_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  turn_id INTEGER NOT NULL,
  turn_idx INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  run_id INTEGER NOT NULL,
  status TEXT NOT NULL,
  target_record_id INTEGER,
  target_error_json TEXT,
  evaluator_results_json TEXT NOT NULL DEFAULT '{}',
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (expt_id, item_id, turn_id)
);

CREATE INDEX IF NOT EXISTS idx_turn_results_item ON turn_results(expt_id, item_id);

CREATE TABLE IF NOT EXISTS expt_stats (
  expt_id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  pending_cnt INTEGER NOT NULL DEFAULT 0,
  processing_cnt INTEGER NOT NULL DEFAULT 0,
  success_cnt INTEGER NOT NULL DEFAULT 0,
  failed_cnt INTEGER NOT NULL DEFAULT 0,
  terminated_cnt INTEGER NOT NULL DEFAULT 0,
  total_cnt INTEGER NOT NULL DEFAULT 0,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS expt_aggr_results (
  expt_id INTEGER NOT NULL,
  evaluator_version_id INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  results_json TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (expt_id, evaluator_version_id)
);

CREATE TABLE IF NOT EXISTS evaluators (
  id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  kind TEXT NOT NULL,
  draft_json TEXT NOT NULL,
  latest_version TEXT,
  created_by TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  deleted_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_evaluators_space_name
  ON evaluators(space_id, name) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS evaluator_versions (
  id INTEGER PRIMARY KEY,
  evaluator_id INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  version TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  content_json TEXT NOT NULL,
  aggregators_json TEXT NOT NULL,
  value_set_json TEXT,
  content_hash TEXT NOT NULL,
  created_by TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  UNIQUE (evaluator_id, version)
);

CREATE TABLE IF NOT EXISTS evaluator_records (
  id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  evaluator_version_id INTEGER NOT NULL,
  expt_id INTEGER,
  run_id INTEGER,
  item_id INTEGER,
  turn_id INTEGER,
  input_json TEXT NOT NULL,
  output_json TEXT,
  status TEXT NOT NULL,
  error_json TEXT,
  correction_json TEXT,
  trace_id TEXT,
  created_by TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evaluator_records_expt ON evaluator_records(expt_id);

CREATE TABLE IF NOT EXISTS eval_targets (
  id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  kind TEXT NOT NULL,
  source_id TEXT NOT NULL,
  created_by TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  UNIQUE (space_id, kind, source_id)
);

CREATE TABLE IF NOT EXISTS eval_target_versions (
  id INTEGER PRIMARY KEY,
  target_id INTEGER NOT NULL,
  space_id INTEGER NOT NULL,
  source_version TEXT NOT NULL,
  config_json TEXT NOT NULL,
  source_info_json TEXT,
  created_at INTEGER NOT NULL,
  UNIQUE (target_id, source_version)
);

CREATE TABLE IF NOT EXISTS target_records (
  id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  target_id INTEGER NOT NULL,
  target_version_id INTEGER NOT NULL,
  expt_id INTEGER,
  item_id INTEGER,
  turn_id INTEGER,
  input_json TEXT NOT NULL,
  output_json TEXT,
  status TEXT NOT NULL,
  error_json TEXT,
  latency_ms INTEGER NOT NULL DEFAULT 0,
  trace_id TEXT,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_target_records_expt ON target_records(expt_id);

CREATE TABLE IF NOT EXISTS idempotency_keys (
  key TEXT PRIMARY KEY,
  expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dist_locks (
  name TEXT PRIMARY KEY,
  holder TEXT,
  token INTEGER NOT NULL,
  expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS space_quotas (
  space_id INTEGER PRIMARY KEY,
  cap INTEGER NOT NULL,
  in_use INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS quota_holders (
  expt_id INTEGER PRIMARY KEY,
  space_id INTEGER NOT NULL,
  admitted_at INTEGER NOT NULL
);
"#;
