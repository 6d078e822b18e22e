use super::{ChatRequest, ChatResponse, LlmClient};
use async_trait::async_trait;
use loopeval_core::model::TokenUsage;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Scripted client for tests and offline runs.
///
/// Queued replies are served in order; once the queue is empty every call
/// gets the fallback text. Queued `None` entries simulate a provider outage.
pub struct FakeLlm {
    queue: Mutex<VecDeque<Option<String>>>,
    fallback: String,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeLlm {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Some(text.into()));
        self
    }

    pub fn outage(self) -> Self {
        self.push(None);
        self
    }

    fn push(&self, entry: Option<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(entry);
        }
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ChatResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow::anyhow!("fake llm poisoned"))?
            .push(req.clone());
        let next = self
            .queue
            .lock()
            .map_err(|_| anyhow::anyhow!("fake llm poisoned"))?
            .pop_front();
        let text = match next {
            Some(Some(t)) => t,
            Some(None) => anyhow::bail!("fake provider outage"),
            None => self.fallback.clone(),
        };
        let input_tokens: usize = req.messages.iter().map(|m| m.content.split_whitespace().count()).sum();
        Ok(ChatResponse {
            usage: TokenUsage {
                input_tokens: input_tokens as i64,
                output_tokens: text.split_whitespace().count() as i64,
            },
            model: if req.model.model.is_empty() {
                "fake".into()
            } else {
                req.model.model.clone()
            },
            text,
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_fallback() {
        let llm = FakeLlm::new("default").reply("first").outage();
        let req = ChatRequest::default();
        assert_eq!(llm.chat(&req).await.unwrap().text, "first");
        assert!(llm.chat(&req).await.is_err());
        assert_eq!(llm.chat(&req).await.unwrap().text, "default");
        assert_eq!(llm.requests().len(), 3);
    }
}
