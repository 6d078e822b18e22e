use crate::errors::{EvalError, EvalResult};
use crate::events::{BackoffPolicy, Envelope, EventBus, EventType};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> EventType;

    async fn handle(&self, env: &Envelope) -> EvalResult<()>;

    /// Called once redelivery is no longer allowed; marks the entity failed.
    async fn on_exhausted(&self, env: &Envelope, err: &EvalError) -> EvalResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

/// Pulls envelopes off the bus and runs handlers with the redelivery budget.
pub struct Dispatcher {
    bus: Arc<dyn EventBus>,
    handlers: Vec<(Arc<dyn EventHandler>, usize)>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn EventBus>, retry: RetryPolicy) -> Self {
        Self {
            bus,
            handlers: Vec::new(),
            retry,
        }
    }

    pub fn register(mut self, handler: Arc<dyn EventHandler>, workers: usize) -> Self {
        self.handlers.push((handler, workers.max(1)));
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (handler, workers) in &self.handlers {
            for worker in 0..*workers {
                let bus = self.bus.clone();
                let handler = handler.clone();
                let retry = self.retry;
                let mut shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    let t = handler.event_type();
                    tracing::debug!(event = "dispatcher.worker_started", event_type = t.as_str(), worker);
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            env = bus.next(t) => match env {
                                Some(env) => process(bus.as_ref(), handler.as_ref(), retry, env).await,
                                None => break,
                            }
                        }
                    }
                }));
            }
        }
        handles
    }
}

/// Runs one envelope through a handler and applies the retry decision.
pub async fn process(bus: &dyn EventBus, handler: &dyn EventHandler, retry: RetryPolicy, env: Envelope) {
    let t = env.event_type.as_str();
    let err = match handler.handle(&env).await {
        Ok(()) => return,
        Err(e) => e,
    };

    if err.is_retriable() && env.retry_count < retry.max_retries {
        let delay = retry.backoff.delay(env.retry_count);
        tracing::warn!(
            event = "dispatcher.retry",
            event_type = t,
            retry_count = env.retry_count,
            delay_ms = delay.as_millis() as u64,
            trace_id = %env.trace_id,
            error = %err,
        );
        if let Err(e) = bus.publish_after(env.retried(), delay).await {
            tracing::error!(event = "dispatcher.republish_failed", event_type = t, error = %e);
        }
        return;
    }

    let final_err = if err.is_retriable() {
        EvalError::ExhaustedRetries(format!("last error: {}", err.extra()))
    } else {
        err
    };
    tracing::error!(
        event = "dispatcher.exhausted",
        event_type = t,
        retry_count = env.retry_count,
        trace_id = %env.trace_id,
        error = %final_err,
    );
    if let Err(e) = handler.on_exhausted(&env, &final_err).await {
        tracing::error!(event = "dispatcher.on_exhausted_failed", event_type = t, error = %e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AggregateCalculateEvent, MemoryEventBus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        exhausted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn event_type(&self) -> EventType {
            EventType::AggregateCalculate
        }
        async fn handle(&self, _env: &Envelope) -> EvalResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(EvalError::UpstreamUnavailable("flaky".into()))
            } else {
                Ok(())
            }
        }
        async fn on_exhausted(&self, _env: &Envelope, err: &EvalError) -> EvalResult<()> {
            self.exhausted.lock().unwrap().push(err.to_string());
            Ok(())
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
            },
        }
    }

    async fn drive(bus: &MemoryEventBus, h: &Flaky, retry: RetryPolicy, rounds: usize) {
        for _ in 0..rounds {
            let env = tokio::time::timeout(Duration::from_secs(1), bus.next(EventType::AggregateCalculate))
                .await
                .unwrap()
                .unwrap();
            process(bus, h, retry, env).await;
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let bus = MemoryEventBus::new();
        let h = Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
            exhausted: Mutex::new(vec![]),
        };
        let env = Envelope::wrap(&AggregateCalculateEvent { expt_id: 1, space_id: 1 }, "t").unwrap();
        bus.publish(env).await.unwrap();
        drive(&bus, &h, policy(3), 3).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert!(h.exhausted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_calls_handler_once() {
        let bus = MemoryEventBus::new();
        let h = Flaky {
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
            exhausted: Mutex::new(vec![]),
        };
        let env = Envelope::wrap(&AggregateCalculateEvent { expt_id: 1, space_id: 1 }, "t").unwrap();
        bus.publish(env).await.unwrap();
        drive(&bus, &h, policy(2), 3).await;
        let ex = h.exhausted.lock().unwrap();
        assert_eq!(ex.len(), 1);
        assert!(ex[0].contains("exhausted retries"));
    }
}
