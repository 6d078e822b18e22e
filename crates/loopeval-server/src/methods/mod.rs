use loopeval_core::context::{Ctx, Session};
use loopeval_core::dataset::MemoryEvalSets;
use loopeval_core::engine::Engine;
use loopeval_core::EvalError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub mod eval_set;
pub mod evaluator;
pub mod experiment;
pub mod target;

pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const PARSE_ERROR: i32 = -32700;

pub struct MethodContext {
    pub engine: Engine,
    /// Same provider the engine reads from; the eval_set methods write to it.
    pub eval_sets: Arc<MemoryEvalSets>,
}

impl MethodContext {
    /// Per-request context. `params.user_id` names the caller session.
    pub fn request_ctx(&self, params: &Value, trace_id: &str) -> Ctx {
        let session = match params.get("user_id").and_then(|v| v.as_str()) {
            Some(u) if !u.is_empty() => Session::new(u),
            _ => Session::system(),
        };
        Ctx::new(session).with_trace_id(trace_id)
    }
}

#[derive(Debug)]
pub enum MethodError {
    NotFound(String),
    InvalidParams(String),
    Eval(EvalError),
}

impl From<EvalError> for MethodError {
    fn from(e: EvalError) -> Self {
        MethodError::Eval(e)
    }
}

impl From<anyhow::Error> for MethodError {
    fn from(e: anyhow::Error) -> Self {
        MethodError::Eval(e.into())
    }
}

impl MethodError {
    pub fn code(&self) -> i32 {
        match self {
            MethodError::NotFound(_) => METHOD_NOT_FOUND,
            MethodError::InvalidParams(_) => INVALID_PARAMS,
            MethodError::Eval(e) => e.code(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            MethodError::NotFound(m) => format!("Method not found: {}", m),
            MethodError::InvalidParams(m) => format!("Invalid params: {}", m),
            MethodError::Eval(e) => e.to_string(),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            MethodError::Eval(e) => Some(serde_json::json!({
                "kind": e.kind(),
                "extra": e.extra(),
                "retriable": e.is_retriable(),
            })),
            _ => None,
        }
    }
}

pub type MethodResult = Result<Value, MethodError>;

pub(crate) fn parse<T: DeserializeOwned>(params: &Value) -> Result<T, MethodError> {
    serde_json::from_value(params.clone()).map_err(|e| MethodError::InvalidParams(e.to_string()))
}

pub(crate) fn reply<T: Serialize>(v: T) -> MethodResult {
    serde_json::to_value(v).map_err(|e| MethodError::Eval(e.into()))
}

pub fn list_methods() -> Vec<&'static str> {
    let mut out = Vec::new();
    out.extend_from_slice(experiment::METHODS);
    out.extend_from_slice(evaluator::METHODS);
    out.extend_from_slice(target::METHODS);
    out.extend_from_slice(eval_set::METHODS);
    out
}

pub async fn handle_call(ctx: &MethodContext, method: &str, params: &Value, trace_id: &str) -> MethodResult {
    let rctx = ctx.request_ctx(params, trace_id);
    match method.split_once('.') {
        Some(("experiment", name)) => experiment::call(ctx, &rctx, name, params).await,
        Some(("evaluator", name)) => evaluator::call(ctx, &rctx, name, params).await,
        Some(("target", name)) => target::call(ctx, &rctx, name, params).await,
        Some(("eval_set", name)) => eval_set::call(ctx, &rctx, name, params).await,
        _ => Err(MethodError::NotFound(method.to_string())),
    }
}
