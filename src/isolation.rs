//! Isolation boundary
//!
//! The only place where uncontrolled failures (panics, arbitrary errors) are
//! turned into [`AgentFailure`] values.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use tracing::warn;

use crate::error::AgentFailure;
use crate::task::AgentResult;

/// Run `work`, converting a panic into a permanent failure
pub async fn isolate<F, T>(work: F) -> Result<T, AgentFailure>
where
    F: Future<Output = Result<T, AgentFailure>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(panic = %message, "Work unit panicked inside isolation boundary");
            Err(AgentFailure::permanent(format!("internal error: {}", message)))
        }
    }
}

/// Run a work unit that reports errors through `anyhow`
///
/// Errors are classified from their message; an [`AgentFailure`] carried in
/// the error chain is passed through untouched.
pub async fn isolate_fallible<F, T>(work: F) -> AgentResult
where
    F: Future<Output = anyhow::Result<T>>,
    T: Serialize,
{
    isolate(async move {
        let value = work.await.map_err(classify_error)?;
        serde_json::to_value(value)
            .map_err(|e| AgentFailure::permanent(format!("unserializable output: {}", e)))
    })
    .await
}

/// Map an arbitrary error onto the failure taxonomy
pub fn classify_error(error: anyhow::Error) -> AgentFailure {
    if let Some(failure) = error.downcast_ref::<AgentFailure>() {
        return failure.clone();
    }
    classify(&format!("{:#}", error))
}

/// Classify an error message
///
/// Timeouts, rate limits, connection problems and 5xx statuses are transient;
/// everything else is permanent.
pub fn classify(message: &str) -> AgentFailure {
    let lower = message.to_lowercase();
    let transient = [
        "timeout",
        "timed out",
        "rate limit",
        "too many requests",
        "429",
        "connection",
        "temporar",
        "unavailable",
        "overloaded",
        "500",
        "502",
        "503",
        "504",
    ];

    if transient.iter().any(|needle| lower.contains(needle)) {
        AgentFailure::transient(message)
    } else {
        AgentFailure::permanent(message)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_passes_results_through() {
        let ok: AgentResult = isolate(async { Ok(json!(1)) }).await;
        assert_eq!(ok.unwrap(), json!(1));

        let err: AgentResult = isolate(async { Err(AgentFailure::transient("429")) }).await;
        assert_eq!(err.unwrap_err().kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_panic_becomes_permanent_failure() {
        let result: AgentResult = isolate(async {
            let items: Vec<u32> = Vec::new();
            Ok(json!(items[3]))
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(failure.message.contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_fallible_classification() {
        let result = isolate_fallible(async {
            Err::<(), _>(anyhow::anyhow!("upstream returned 503 Service Unavailable"))
        })
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
        assert!(failure.retryable);

        let result = isolate_fallible(async { Err::<(), _>(anyhow::anyhow!("invalid api key")) }).await;
        assert_eq!(result.unwrap_err().kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_fallible_keeps_agent_failure() {
        let result = isolate_fallible(async {
            Err::<(), _>(anyhow::Error::new(AgentFailure::circuit_open(
                "llm",
                std::time::Duration::from_secs(1),
            )))
        })
        .await;
        assert_eq!(result.unwrap_err().kind, FailureKind::CircuitOpen);
    }

    #[tokio::test]
    async fn test_fallible_serializes_output() {
        #[derive(Serialize)]
        struct Answer {
            text: &'static str,
        }

        let result = isolate_fallible(async { Ok(Answer { text: "hi" }) }).await;
        assert_eq!(result.unwrap(), json!({"text": "hi"}));
    }

    #[test]
    fn test_classify() {
        assert!(classify("Request timed out").retryable);
        assert!(classify("Rate limit exceeded").retryable);
        assert!(!classify("unauthorized").retryable);
    }
}
