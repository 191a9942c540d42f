//! # Simple Chain Example
//!
//! The smallest possible job chain: one entry type, one processor, no
//! blockers. Uses the in-memory adapters so the example runs with no
//! database — swap in `jobchain-postgres`/`jobchain-notify-postgres` for a
//! durable deployment, the `StateAdapter`/`NotifyAdapter` contracts don't
//! change.

use anyhow::Result;
use async_trait::async_trait;
use jobchain_core::{
    AttemptContext, AttemptError, Client, ContinuationRequest, Disposition, Executor,
    ExecutorConfig, JobProcessor, JobTypeDef, JobTypeRegistry, JobTypeValidationError,
    ProcessorRegistry, StartJobChainSpec, TypeRegistry, WaitForChainConfig,
};
use jobchain_testing::{InMemoryNotifyAdapter, InMemoryStateAdapter};
use serde_json::{json, Value};
use std::sync::Arc;

/// Thin adapter over a [`JobTypeRegistry`] satisfying the core
/// [`TypeRegistry`] contract. Input/output parsing is identity here —
/// schema validation is an external collaborator's job (§6), not core's.
struct AppRegistry(JobTypeRegistry);

impl TypeRegistry for AppRegistry {
    fn validate_entry(&self, type_name: &str) -> Result<(), JobTypeValidationError> {
        if self.0.is_entry(type_name) {
            Ok(())
        } else {
            Err(JobTypeValidationError::NotEntryPoint(type_name.to_string()))
        }
    }

    fn parse_input(&self, _type_name: &str, value: &Value) -> Result<Value, JobTypeValidationError> {
        Ok(value.clone())
    }

    fn parse_output(&self, _type_name: &str, value: &Value) -> Result<Value, JobTypeValidationError> {
        Ok(value.clone())
    }

    fn validate_continue_with(
        &self,
        from_type_name: &str,
        to: &ContinuationRequest,
    ) -> Result<(), JobTypeValidationError> {
        if self.0.allows_continuation(from_type_name, &to.type_name) {
            Ok(())
        } else {
            Err(JobTypeValidationError::InvalidContinuation(
                from_type_name.to_string(),
                to.type_name.clone(),
            ))
        }
    }

    fn validate_blockers(
        &self,
        type_name: &str,
        blockers: &[ContinuationRequest],
    ) -> Result<(), JobTypeValidationError> {
        for blocker in blockers {
            if !self.0.allows_blocker(type_name, &blocker.type_name) {
                return Err(JobTypeValidationError::InvalidBlockers(type_name.to_string()));
            }
        }
        Ok(())
    }
}

/// Doubles the `value` field of its input.
struct Doubler;

#[async_trait]
impl JobProcessor for Doubler {
    async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
        let value = ctx.input()["value"].as_i64().unwrap_or(0);
        Ok(Disposition::Complete(json!({ "result": value * 2 })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let registry = AppRegistry(JobTypeRegistry::new([JobTypeDef::new("double").entry()])?);
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());

    let client = Client::new(state.clone(), notify.clone(), registry);

    let processors = ProcessorRegistry::new().register("double", Arc::new(Doubler));
    let executor = Executor::new(state, notify, ExecutorConfig::new("worker-1"), processors);

    let executor_handle = {
        let executor = Arc::new(executor);
        let handle = tokio::spawn({
            let executor = executor.clone();
            async move { executor.run().await }
        });
        (executor, handle)
    };

    let created = client
        .start_job_chain(StartJobChainSpec {
            type_name: "double".into(),
            input: json!({ "value": 21 }),
            blockers: vec![],
            deduplication: None,
            schedule: None,
            trace_context: None,
        })
        .await?;
    println!("started chain {}", created.id);

    let view = client
        .wait_for_job_chain_completion(
            created.id,
            "double",
            WaitForChainConfig::default(),
            None,
        )
        .await?;
    println!("chain completed with output: {}", view.output.unwrap());

    let (executor, handle) = executor_handle;
    executor.request_stop();
    handle.await?;

    Ok(())
}
