//! Statement execution with failover.
//!
//! # Responsibilities
//! - Acquire a session from the upstream's peers
//! - Drive the protocol machine to completion
//! - Return the session with the request's outcome
//! - Move to another peer while the statement has not been dispatched
//!
//! # Design Decisions
//! - A statement that may have reached a backend is never re-sent
//! - Backend errors are answers, not failures: no retry, no health penalty
//! - Retries spend from a shared budget and back off with jitter

use std::sync::Arc;

use crate::config::schema::RetryConfig;
use crate::error::GatewayError;
use crate::protocol::context::RequestContext;
use crate::protocol::machine::ProtocolMachine;
use crate::protocol::result::QueryResult;
use crate::protocol::statement::CompiledStatement;
use crate::resilience::backoff::Backoff;
use crate::resilience::retries::RetryBudget;
use crate::upstream::pool::ReleaseOutcome;
use crate::upstream::SessionPeers;

pub struct Executor {
    retry: RetryConfig,
    budget: Arc<RetryBudget>,
}

impl Executor {
    pub fn new(retry: RetryConfig, budget: Arc<RetryBudget>) -> Self {
        Self { retry, budget }
    }

    fn max_attempts(&self) -> u32 {
        if self.retry.enabled {
            self.retry.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Run one statement, returning its result or the final error.
    pub async fn execute(
        &self,
        peers: &SessionPeers,
        statement: &CompiledStatement,
        request_id: &str,
    ) -> Result<QueryResult, GatewayError> {
        self.budget.record_request();
        let max_attempts = self.max_attempts();
        let mut tried = Vec::new();
        let mut attempts = 0;
        let mut last_error = None;

        loop {
            attempts += 1;
            let (error, dispatched) = match peers.acquire(&mut tried).await {
                Ok(None) => {
                    return Err(last_error.unwrap_or_else(|| GatewayError::PoolExhausted {
                        target: peers.upstream().name().to_string(),
                    }));
                }
                Ok(Some(mut acquired)) => {
                    let target = acquired.lease.target().clone();
                    let mut ctx = RequestContext::new(statement.clone());
                    let mut machine = ProtocolMachine::new(&target.policy);
                    let run = match acquired.lease.session_mut() {
                        Some(session) => machine.run(session, &mut ctx).await,
                        None => Err(GatewayError::Protocol("lease without a session".to_string())),
                    };

                    match run {
                        Ok(()) => {
                            let listens = ctx.take_listens();
                            peers.release(acquired, ReleaseOutcome::clean(listens), None);
                            if let Some(message) = ctx.backend_error() {
                                tracing::debug!(request_id = %request_id, pool = %target.name, "Statement failed on backend");
                                return Err(GatewayError::Backend(message.to_string()));
                            }
                            return Ok(ctx.into_result());
                        }
                        Err(e) => {
                            tracing::warn!(
                                request_id = %request_id,
                                pool = %target.name,
                                attempt = attempts,
                                error = %e,
                                "Statement attempt failed"
                            );
                            peers.release(acquired, ReleaseOutcome::failed(), Some(&e));
                            (e, machine.dispatched())
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(request_id = %request_id, attempt = attempts, error = %e, "Session acquire failed");
                    (e, false)
                }
            };

            let retryable = error.allows_failover() && !dispatched;
            if !retryable || attempts >= max_attempts || !self.budget.can_retry() {
                return Err(error);
            }

            let backoff = Backoff::from(&self.retry).delay(attempts);
            tracing::info!(request_id = %request_id, attempt = attempts, delay = ?backoff, error = %error, "Failing over to next peer");
            last_error = Some(error);
            tokio::time::sleep(backoff).await;
        }
    }
}
