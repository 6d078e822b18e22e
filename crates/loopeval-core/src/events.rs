use crate::errors::{EvalError, EvalResult};
use crate::model::{now_ms, EvalMode, ExptId, ItemId, RunId, SpaceId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExptSchedule,
    ItemEval,
    AggregateCalculate,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::ExptSchedule,
        EventType::ItemEval,
        EventType::AggregateCalculate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ExptSchedule => "expt_schedule",
            EventType::ItemEval => "item_eval",
            EventType::AggregateCalculate => "aggregate_calculate",
        }
    }
}

pub trait TypedEvent: Serialize + DeserializeOwned + Send + Sync {
    const TYPE: EventType;
    fn retry_count(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptScheduleEvent {
    pub expt_id: ExptId,
    pub run_id: RunId,
    pub mode: EvalMode,
    pub space_id: SpaceId,
    #[serde(default)]
    pub retry_count: u32,
}

impl TypedEvent for ExptScheduleEvent {
    const TYPE: EventType = EventType::ExptSchedule;
    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEvalEvent {
    pub expt_id: ExptId,
    pub run_id: RunId,
    pub item_id: ItemId,
    pub space_id: SpaceId,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

impl TypedEvent for ItemEvalEvent {
    const TYPE: EventType = EventType::ItemEval;
    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCalculateEvent {
    pub expt_id: ExptId,
    pub space_id: SpaceId,
}

impl TypedEvent for AggregateCalculateEvent {
    const TYPE: EventType = EventType::AggregateCalculate;
    fn retry_count(&self) -> u32 {
        0
    }
}

/// Wire envelope: `{type, payload, retry_count, enqueue_at, trace_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub enqueue_at: i64,
    pub trace_id: String,
}

impl Envelope {
    pub fn wrap<T: TypedEvent>(ev: &T, trace_id: &str) -> EvalResult<Self> {
        Ok(Self {
            event_type: T::TYPE,
            payload: serde_json::to_value(ev)?,
            retry_count: ev.retry_count(),
            enqueue_at: now_ms(),
            trace_id: trace_id.to_string(),
        })
    }

    pub fn decode<T: TypedEvent>(&self) -> EvalResult<T> {
        if self.event_type != T::TYPE {
            return Err(EvalError::InvalidParam(format!(
                "expected {} event, got {}",
                T::TYPE.as_str(),
                self.event_type.as_str()
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Copy for redelivery with the retry counter bumped in both envelope and payload.
    pub fn retried(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next.enqueue_at = now_ms();
        if let Some(obj) = next.payload.as_object_mut() {
            if obj.contains_key("retry_count") {
                obj.insert("retry_count".into(), next.retry_count.into());
            }
        }
        next
    }
}

/// `min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, env: Envelope) -> EvalResult<()>;
    async fn publish_after(&self, env: Envelope, delay: Duration) -> EvalResult<()>;
    /// Next envelope of a type; `None` once the bus is closed.
    async fn next(&self, event_type: EventType) -> Option<Envelope>;
}

pub async fn publish_event<T: TypedEvent>(bus: &dyn EventBus, ev: &T, trace_id: &str) -> EvalResult<()> {
    bus.publish(Envelope::wrap(ev, trace_id)?).await
}

pub async fn publish_event_after<T: TypedEvent>(
    bus: &dyn EventBus,
    ev: &T,
    trace_id: &str,
    delay: Duration,
) -> EvalResult<()> {
    bus.publish_after(Envelope::wrap(ev, trace_id)?, delay).await
}

struct Channel {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    published: AtomicU64,
}

/// In-process bus: one unbounded queue per event type, shared by all consumers.
#[derive(Clone)]
pub struct MemoryEventBus {
    channels: Arc<HashMap<EventType, Channel>>,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        for t in EventType::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            channels.insert(
                t,
                Channel {
                    tx,
                    rx: Mutex::new(rx),
                    published: AtomicU64::new(0),
                },
            );
        }
        Self {
            channels: Arc::new(channels),
        }
    }

    /// Total envelopes published for a type, including delayed ones once sent.
    pub fn published(&self, t: EventType) -> u64 {
        self.channels
            .get(&t)
            .map(|c| c.published.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn send(&self, env: Envelope) -> EvalResult<()> {
        let ch = self
            .channels
            .get(&env.event_type)
            .ok_or_else(|| EvalError::Internal(format!("no channel for {}", env.event_type.as_str())))?;
        ch.published.fetch_add(1, Ordering::Relaxed);
        ch.tx
            .send(env)
            .map_err(|_| EvalError::Internal("event bus closed".into()))
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, env: Envelope) -> EvalResult<()> {
        self.send(env)
    }

    async fn publish_after(&self, env: Envelope, delay: Duration) -> EvalResult<()> {
        if delay.is_zero() {
            return self.send(env);
        }
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = bus.send(env) {
                tracing::warn!(event = "bus.delayed_publish_failed", error = %e);
            }
        });
        Ok(())
    }

    async fn next(&self, event_type: EventType) -> Option<Envelope> {
        let ch = self.channels.get(&event_type)?;
        let mut rx = ch.rx.lock().await;
        rx.recv().await
    }
}
