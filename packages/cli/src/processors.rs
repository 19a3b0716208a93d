//! Processors built into the `jobq` binary.

use std::time::Duration;

use actors::{FnProcessor, ProcessorRegistry};
use queue_core::ProcessError;

/// Registry with the `echo`, `sleep` and `fail` processors.
///
/// - `echo` logs its payload.
/// - `sleep` waits `payload.seconds` (default 5).
/// - `fail` fails transiently unless `payload.fail` is false, or terminally
///   when `payload.terminal` is true.
pub fn builtin() -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with(FnProcessor::new("echo", |job| {
            let id = job.id;
            let payload = job.payload.clone();
            Box::pin(async move {
                tracing::info!(job_id = %id, "Echo job: {}", payload);
                Ok(())
            })
        }))
        .with(FnProcessor::new("sleep", |job| {
            let seconds = job
                .payload
                .get("seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(5);
            Box::pin(async move {
                tracing::debug!("Sleeping for {} seconds", seconds);
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                Ok(())
            })
        }))
        .with(FnProcessor::new("fail", |job| {
            let should_fail = job
                .payload
                .get("fail")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            let terminal = job
                .payload
                .get("terminal")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Box::pin(async move {
                match (should_fail, terminal) {
                    (false, _) => Ok(()),
                    (true, true) => Err(ProcessError::terminal("Intentional terminal failure")),
                    (true, false) => Err(ProcessError::transient("Intentional failure")),
                }
            })
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actors::Processor;
    use chrono::Utc;
    use queue_core::NewJob;
    use serde_json::json;

    #[tokio::test]
    async fn fail_processor_follows_its_payload() {
        let registry = builtin();
        assert_eq!(registry.keys(), vec!["echo", "fail", "sleep"]);

        let fail = registry.get("fail").unwrap();
        let run = |payload| {
            let job = NewJob::new("fail", payload).into_item(Utc::now());
            fail.process(&job)
        };

        assert_eq!(run(json!({})).await, Err(ProcessError::transient("Intentional failure")));
        assert_eq!(run(json!({ "fail": false })).await, Ok(()));
        assert_eq!(
            run(json!({ "terminal": true })).await,
            Err(ProcessError::terminal("Intentional terminal failure"))
        );
    }

    #[tokio::test]
    async fn sleep_processor_honours_seconds() {
        let sleep = builtin().get("sleep").unwrap();
        let job = NewJob::new("sleep", json!({ "seconds": 0 })).into_item(Utc::now());
        assert_eq!(sleep.process(&job).await, Ok(()));
    }
}
