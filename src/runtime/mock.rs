use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{CompletionRequest, Engine, LoadProgress, ProgressFn, Runtime};
use crate::cache::CacheProbe;

#[derive(Default)]
struct Recorder {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: Mutex<Vec<String>>,
    create_calls: AtomicUsize,
    unload_calls: AtomicUsize,
    failures_left: AtomicUsize,
}

/// A scripted runtime for tests. Engines it creates return pre-defined
/// replies in order and record every request.
pub struct MockRuntime {
    recorder: Arc<Recorder>,
    load_delay: Duration,
    unload_delay: Duration,
    create_error: Option<String>,
    unload_error: Option<String>,
    progress: Vec<LoadProgress>,
    cached: Option<bool>,
}

impl MockRuntime {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let recorder = Recorder {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            ..Recorder::default()
        };
        Self {
            recorder: Arc::new(recorder),
            load_delay: Duration::ZERO,
            unload_delay: Duration::ZERO,
            create_error: None,
            unload_error: None,
            progress: Vec::new(),
            cached: Some(false),
        }
    }

    /// Make every create call sleep first, so callers can overlap.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make every engine teardown sleep first.
    pub fn with_unload_delay(mut self, delay: Duration) -> Self {
        self.unload_delay = delay;
        self
    }

    /// Emit these ticks from every create call.
    pub fn with_progress(mut self, ticks: Vec<LoadProgress>) -> Self {
        self.progress = ticks;
        self
    }

    /// Fail every create call with `message`.
    pub fn failing(self, message: &str) -> Self {
        self.failing_times(message, usize::MAX)
    }

    /// Fail the first `times` create calls with `message`.
    pub fn failing_times(mut self, message: &str, times: usize) -> Self {
        self.create_error = Some(message.to_string());
        self.recorder.failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Make engine teardown fail with `message`.
    pub fn failing_unload(mut self, message: &str) -> Self {
        self.unload_error = Some(message.to_string());
        self
    }

    /// `Some(hit)` answers the cache probe; `None` makes the probe error.
    pub fn with_cache(mut self, cached: Option<bool>) -> Self {
        self.cached = cached;
        self
    }

    pub fn create_calls(&self) -> usize {
        self.recorder.create_calls.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.recorder.unload_calls.load(Ordering::SeqCst)
    }

    /// Every completion request seen so far, oldest first.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.recorder.requests.lock().await.clone()
    }

    /// Ordered log of lifecycle calls, e.g. `["create:a", "unload:a", "create:b"]`.
    pub async fn calls(&self) -> Vec<String> {
        self.recorder.calls.lock().await.clone()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create(&self, model: &str, on_progress: ProgressFn) -> Result<Arc<dyn Engine>> {
        self.recorder.create_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder
            .calls
            .lock()
            .await
            .push(format!("create:{model}"));

        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        for tick in &self.progress {
            on_progress(tick.clone());
        }

        if let Some(message) = &self.create_error {
            let left = self.recorder.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.recorder
                    .failures_left
                    .store(left.saturating_sub(1), Ordering::SeqCst);
                bail!("{message}");
            }
        }

        Ok(Arc::new(MockEngine {
            model: model.to_string(),
            recorder: Arc::clone(&self.recorder),
            unload_error: self.unload_error.clone(),
            unload_delay: self.unload_delay,
        }))
    }
}

#[async_trait]
impl CacheProbe for MockRuntime {
    async fn lookup(&self, _model: &str) -> Result<bool> {
        match self.cached {
            Some(hit) => Ok(hit),
            None => bail!("MockRuntime: cache storage unavailable"),
        }
    }
}

struct MockEngine {
    model: String,
    recorder: Arc<Recorder>,
    unload_error: Option<String>,
    unload_delay: Duration,
}

#[async_trait]
impl Engine for MockEngine {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut requests = self.recorder.requests.lock().await;
        requests.push(request.clone());
        let called = requests.len();
        drop(requests);

        self.recorder
            .replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("MockRuntime: no more replies (called {called} times)"))
    }

    async fn unload(&self) -> Result<()> {
        self.recorder.unload_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder
            .calls
            .lock()
            .await
            .push(format!("unload:{}", self.model));
        if !self.unload_delay.is_zero() {
            tokio::time::sleep(self.unload_delay).await;
        }
        match &self.unload_error {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}
