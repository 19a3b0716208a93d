//! Job processors, looked up by a job's `processor_key`.
//!
//! A processor either finishes a job or reports a [`ProcessError`]. The
//! worker owns everything around that call: the timeout, panic capture,
//! heartbeats and the retry decision. Processors never touch the store.

use queue_core::{JobItem, ProcessError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Outcome of one processing attempt.
pub type ProcessResult = Result<(), ProcessError>;

/// Boxed attempt future handed back to the worker.
pub type ProcessFuture = Pin<Box<dyn Future<Output = ProcessResult> + Send>>;

/// Work performed for jobs carrying one `processor_key`.
///
/// Return [`ProcessError::Terminal`] when another attempt cannot succeed;
/// any other failure is retried under the retry policy.
pub trait Processor: Send + Sync + 'static {
    fn key(&self) -> &str;

    /// Start an attempt. The future must not borrow `job`.
    fn process(&self, job: &JobItem) -> ProcessFuture;
}

/// Processors available to a worker, keyed by `processor_key`.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    by_key: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor, replacing one already serving its key.
    pub fn register<P: Processor>(&mut self, processor: P) {
        self.by_key
            .insert(processor.key().to_string(), Arc::new(processor));
    }

    pub fn with<P: Processor>(mut self, processor: P) -> Self {
        self.register(processor);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Processor>> {
        self.by_key.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.by_key.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Start an attempt for `job` with the processor serving its key.
    ///
    /// A job whose key has no processor can never succeed here, so the
    /// attempt fails terminally and the job goes straight to the dead
    /// letter queue.
    pub fn dispatch(&self, job: &JobItem) -> ProcessFuture {
        match self.by_key.get(&job.processor_key) {
            Some(processor) => processor.process(job),
            None => {
                let error = unknown_key(&job.processor_key);
                Box::pin(async move { Err(error) })
            }
        }
    }
}

fn unknown_key(key: &str) -> ProcessError {
    ProcessError::terminal(format!("No processor registered for key: {}", key))
}

/// Processor backed by a closure.
pub struct FnProcessor<F>
where
    F: Fn(&JobItem) -> ProcessFuture + Send + Sync + 'static,
{
    key: String,
    run: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&JobItem) -> ProcessFuture + Send + Sync + 'static,
{
    pub fn new(key: impl Into<String>, run: F) -> Self {
        Self {
            key: key.into(),
            run,
        }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&JobItem) -> ProcessFuture + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn process(&self, job: &JobItem) -> ProcessFuture {
        (self.run)(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use queue_core::NewJob;
    use serde_json::json;

    fn registry() -> ProcessorRegistry {
        ProcessorRegistry::new()
            .with(FnProcessor::new("ok", |_job| Box::pin(async { Ok(()) })))
            .with(FnProcessor::new("bad", |job| {
                let key = job.processor_key.clone();
                Box::pin(async move { Err(ProcessError::terminal(format!("{} refused", key))) })
            }))
    }

    #[tokio::test]
    async fn dispatch_runs_the_processor_for_the_job_key() {
        let registry = registry();
        assert!(registry.contains("ok"));
        assert!(!registry.is_empty());
        assert_eq!(registry.keys(), vec!["bad", "ok"]);

        let ok = NewJob::new("ok", json!({})).into_item(Utc::now());
        assert_eq!(registry.dispatch(&ok).await, Ok(()));

        let bad = NewJob::new("bad", json!({})).into_item(Utc::now());
        assert_eq!(
            registry.dispatch(&bad).await,
            Err(ProcessError::terminal("bad refused"))
        );
    }

    #[tokio::test]
    async fn unknown_key_fails_terminally() {
        let registry = registry();
        let job = NewJob::new("missing", json!({})).into_item(Utc::now());

        let result = registry.dispatch(&job).await;
        assert_eq!(
            result,
            Err(ProcessError::terminal("No processor registered for key: missing"))
        );
        assert!(ProcessorRegistry::new().is_empty());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = registry().with(FnProcessor::new("ok", |_job| {
            Box::pin(async { Err(ProcessError::transient("replaced")) })
        }));
        assert_eq!(registry.keys(), vec!["bad", "ok"]);
    }
}
