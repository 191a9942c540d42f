//! # Blocker Chain Example
//!
//! Two independent chains where one structurally depends on the other: a
//! `report` chain is created blocked on a `rate` chain, and only becomes
//! schedulable once `rate` completes. Demonstrates [`Client::with_notify`]
//! to create both chains in a single transaction so the blocker is adopted
//! under the dependent chain's root (deleting `report` also deletes `rate`).

use anyhow::Result;
use async_trait::async_trait;
use jobchain_core::{
    AttemptContext, AttemptError, Client, ContinuationRequest, Disposition, Executor,
    ExecutorConfig, JobProcessor, JobTypeDef, JobTypeRegistry, JobTypeValidationError,
    ProcessorRegistry, StartJobChainSpec, StateAdapter, TypeRegistry, WaitForChainConfig,
};
use jobchain_testing::{InMemoryNotifyAdapter, InMemoryStateAdapter};
use serde_json::{json, Value};
use std::sync::Arc;

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

/// Looks up a fixed exchange rate.
struct RateProcessor;

#[async_trait]
impl JobProcessor for RateProcessor {
    async fn process(&self, _ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
        Ok(Disposition::Complete(json!({ "rate": 1.08 })))
    }
}

/// Reads its blocker's completed output directly off the state store —
/// `get_job_blockers` is a read-only operation safe to call outside a
/// transaction (§4.1).
struct ReportProcessor {
    state: InMemoryStateAdapter,
}

#[async_trait]
impl JobProcessor for ReportProcessor {
    async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
        let blockers = self
            .state
            .get_job_blockers(ctx.job().id)
            .await
            .map_err(|e| AttemptError::Failed(e.into()))?;
        let rate = blockers[0]
            .current_blocker_state
            .output
            .as_ref()
            .and_then(|o| o["rate"].as_f64())
            .unwrap_or(1.0);
        let amount = ctx.input()["amount"].as_f64().unwrap_or(0.0);
        Ok(Disposition::Complete(json!({ "converted": amount * rate })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let registry = AppRegistry(JobTypeRegistry::new([
        JobTypeDef::new("rate").entry(),
        JobTypeDef::new("report").entry().blocker("rate"),
    ])?);
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let client = Client::new(state.clone(), notify.clone(), registry);

    let processors = ProcessorRegistry::new()
        .register("rate", Arc::new(RateProcessor))
        .register(
            "report",
            Arc::new(ReportProcessor {
                state: state.clone(),
            }),
        );
    let executor = Arc::new(Executor::new(
        state,
        notify,
        ExecutorConfig::new("worker-1"),
        processors,
    ));
    let executor_handle = tokio::spawn({
        let executor = executor.clone();
        async move { executor.run().await }
    });

    let client_ref = &client;
    let (rate_id, report_id) = client_ref
        .with_notify(move |ctx| async move {
            let rate = client_ref
                .create_job_chain_in(
                    ctx,
                    StartJobChainSpec {
                        type_name: "rate".into(),
                        input: json!({}),
                        blockers: vec![],
                        deduplication: None,
                        schedule: None,
                        trace_context: None,
                    },
                )
                .await?;
            let report = client_ref
                .create_job_chain_in(
                    ctx,
                    StartJobChainSpec {
                        type_name: "report".into(),
                        input: json!({ "amount": 100.0 }),
                        blockers: vec![rate.id],
                        deduplication: None,
                        schedule: None,
                        trace_context: None,
                    },
                )
                .await?;
            Ok((rate.id, report.id))
        })
        .await?;
    println!("started rate chain {rate_id} and report chain {report_id}");

    let view = client
        .wait_for_job_chain_completion(report_id, "report", WaitForChainConfig::default(), None)
        .await?;
    println!("report completed with output: {}", view.output.unwrap());

    executor.request_stop();
    executor_handle.await?;

    client.delete_job_chains(&[report_id]).await?;
    println!("deleted report chain (and its adopted rate chain)");

    Ok(())
}
