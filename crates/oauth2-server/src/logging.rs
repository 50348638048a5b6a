//! Default decision observer.

use async_trait::async_trait;

use oauth2_server_core::{DecisionHook, DecisionOutcome, DecisionRecord};

/// Logs every policy decision: `debug` when allowed, `warn` when denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDecisionHook;

#[async_trait]
impl DecisionHook for TracingDecisionHook {
    async fn before(&self, record: &DecisionRecord) {
        tracing::trace!(
            event = record.event.as_str(),
            client_id = record.client_id.as_deref().unwrap_or("-"),
            input = %record.input,
            "evaluating policy"
        );
    }

    async fn after(&self, record: &DecisionRecord, outcome: &DecisionOutcome) {
        let client_id = record.client_id.as_deref().unwrap_or("-");
        match outcome {
            DecisionOutcome::Allowed(_) => {
                tracing::debug!(event = record.event.as_str(), client_id, "policy allowed");
            }
            DecisionOutcome::Denied(code) => {
                tracing::warn!(
                    event = record.event.as_str(),
                    client_id,
                    error = code.as_str(),
                    input = %record.input,
                    "policy denied"
                );
            }
        }
    }
}
