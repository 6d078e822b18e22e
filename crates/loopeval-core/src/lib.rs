pub mod aggregate;
pub mod config;
pub mod context;
pub mod dataset;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod events;
pub mod field_mapping;
pub mod idempotency;
pub mod idgen;
pub mod lock;
pub mod model;
pub mod on_error;
pub mod quota;
pub mod status_cache;
pub mod usage;

pub mod evaluator;
pub mod moderation;
pub mod target;

pub mod gc;
pub mod manager;
pub mod result_view;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod worker;

pub use errors::{EvalError, EvalResult};
