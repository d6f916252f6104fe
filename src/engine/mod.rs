//! # Proposal Computation Engine
//!
//! Fee and net amounts are computed on a dedicated multi-thread runtime that
//! is separate from the one accepting connections, so a slow computation
//! never stalls network I/O.
//!
//! [`ComputeEngine::compute_async`] hands back a [`PendingProposal`] future.
//! Awaiting it from any runtime yields the result; dropping it, or letting an
//! outer timeout fire, only detaches the task. A computation that outlives its
//! deadline still runs to completion on the compute pool and its result is
//! discarded.

use crate::codec;
use crate::error::{ProposalError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Status tag carried by every computed proposal
pub const STATUS_PROCESSED: &str = "processed";

/// Upper bound accepted for the simulated delay
pub const MAX_SIMULATED_DELAY: Duration = Duration::from_millis(60_000);

/// Request field names; the first spelling is the canonical one
const CLIENT_ID_KEYS: &[&str] = &["idCliente", "clientId"];
const GROSS_AMOUNT_KEYS: &[&str] = &["valorBruto", "grossAmount"];
const PLAN_KEYS: &[&str] = &["plano", "plan"];

/// Fee tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Plan {
    Starter,
    Pro,
    Vip,
}

impl Plan {
    /// Fee rate applied to the gross amount
    #[must_use]
    pub fn rate(self) -> Decimal {
        match self {
            Self::Starter => Decimal::new(6, 2),
            Self::Pro => Decimal::new(15, 2),
            Self::Vip => Decimal::new(2, 2),
        }
    }

    /// Canonical upper-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starter => "STARTER",
            Self::Pro => "PRO",
            Self::Vip => "VIP",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = ProposalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTER" => Ok(Self::Starter),
            "PRO" => Ok(Self::Pro),
            "VIP" => Ok(Self::Vip),
            _ => Err(ProposalError::validation_error("invalid value for plano")),
        }
    }
}

/// Parsed calculation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRequest {
    pub client_id: Uuid,
    pub gross_amount: Decimal,
    pub plan: Plan,
}

impl ProposalRequest {
    /// Parse `{"idCliente", "valorBruto", "plano"}`
    ///
    /// `clientId`, `grossAmount` and `plan` are accepted as aliases. Sign
    /// checks are left to [`compute`]; only shape is validated here.
    pub fn from_json(body: &str) -> Result<Self> {
        let object = codec::parse_object(body)?;
        let client_id =
            codec::read_required_uuid(&object, codec::resolve_key(&object, CLIENT_ID_KEYS))?;
        let gross_amount =
            codec::read_required_decimal(&object, codec::resolve_key(&object, GROSS_AMOUNT_KEYS))?;
        let plan = codec::read_required_string(&object, codec::resolve_key(&object, PLAN_KEYS))?
            .parse()?;
        Ok(Self {
            client_id,
            gross_amount,
            plan,
        })
    }
}

/// Outcome of a computation
///
/// Serialised as `{"idProposta", "valorLiquido", "taxaAplicada", "status"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResult {
    #[serde(rename = "idProposta", alias = "proposalId")]
    pub proposal_id: Uuid,
    #[serde(
        rename = "valorLiquido",
        alias = "netAmount",
        with = "rust_decimal::serde::arbitrary_precision"
    )]
    pub net_amount: Decimal,
    #[serde(
        rename = "taxaAplicada",
        alias = "feeAmount",
        with = "rust_decimal::serde::arbitrary_precision"
    )]
    pub fee_amount: Decimal,
    pub status: String,
}

impl ProposalResult {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            ProposalError::internal_error("failed to serialise proposal", Some(Box::new(e)))
        })
    }
}

/// Compute fee and net amount for `request`
///
/// `fee = round(gross * rate, 2, half-up)` and `net = gross - fee`.
///
/// ## Errors
/// - `ProposalError::ValidationError`: negative or out-of-range amount
pub fn compute(request: &ProposalRequest) -> Result<ProposalResult> {
    if request.gross_amount < Decimal::ZERO {
        return Err(ProposalError::validation_error(
            "valorBruto must not be negative",
        ));
    }

    let fee = request
        .gross_amount
        .checked_mul(request.plan.rate())
        .ok_or_else(|| ProposalError::validation_error("valorBruto is out of range"))?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let net = request
        .gross_amount
        .checked_sub(fee)
        .ok_or_else(|| ProposalError::validation_error("valorBruto is out of range"))?;

    Ok(ProposalResult {
        proposal_id: Uuid::new_v4(),
        net_amount: net,
        fee_amount: fee,
        status: STATUS_PROCESSED.to_string(),
    })
}

/// Bounded worker pool running computations off the I/O runtime
pub struct ComputeEngine {
    runtime: Option<Runtime>,
    handle: Handle,
    threads: usize,
    simulated_delay: Duration,
}

impl ComputeEngine {
    /// Start a compute pool with `threads` workers
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: zero threads, a delay above
    ///   [`MAX_SIMULATED_DELAY`], or the runtime failed to start
    pub fn new(threads: usize, simulated_delay: Duration) -> Result<Self> {
        if threads == 0 {
            return Err(ProposalError::config_error(
                "compute pool needs at least one thread",
                None,
            ));
        }
        if simulated_delay > MAX_SIMULATED_DELAY {
            return Err(ProposalError::config_error(
                format!(
                    "simulated delay {}ms exceeds {}ms",
                    simulated_delay.as_millis(),
                    MAX_SIMULATED_DELAY.as_millis()
                ),
                None,
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("proposal-compute")
            .enable_time()
            .build()
            .map_err(|e| {
                ProposalError::config_error("failed to start compute pool", Some(Box::new(e)))
            })?;
        let handle = runtime.handle().clone();

        debug!(
            threads,
            simulated_delay_ms = simulated_delay.as_millis() as u64,
            "Compute pool started"
        );

        Ok(Self {
            runtime: Some(runtime),
            handle,
            threads,
            simulated_delay,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn simulated_delay(&self) -> Duration {
        self.simulated_delay
    }

    /// Submit `request` to the compute pool
    ///
    /// Returns immediately; the caller awaits the [`PendingProposal`].
    pub fn compute_async(&self, request: ProposalRequest, request_id: &str) -> PendingProposal {
        let delay = self.simulated_delay;
        let request_id = request_id.to_string();
        let handle = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = compute(&request);
            if let Err(e) = &outcome {
                debug!(request_id = %request_id, error = %e.internal_message(), "Computation rejected");
            }
            outcome
        });
        PendingProposal { handle }
    }

    /// Stop the pool without waiting for in-flight computations
    ///
    /// Pending futures resolve to an interrupted error. Runs when the last
    /// owner drops the engine.
    fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for ComputeEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ComputeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeEngine")
            .field("threads", &self.threads)
            .field("simulated_delay", &self.simulated_delay)
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

/// Handle to a computation running on the compute pool
///
/// Dropping the handle detaches the computation: it runs to completion on
/// the pool and its result is discarded. Request timeouts rely on this.
#[derive(Debug)]
pub struct PendingProposal {
    handle: JoinHandle<Result<ProposalResult>>,
}

impl PendingProposal {
    #[cfg(test)]
    fn abort(&self) {
        self.handle.abort();
    }
}

impl Future for PendingProposal {
    type Output = Result<ProposalResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(e)) if e.is_cancelled() => {
                Poll::Ready(Err(ProposalError::interrupted("computation was cancelled")))
            }
            Poll::Ready(Err(e)) => {
                warn!(error = %e, "Computation task panicked");
                Poll::Ready(Err(ProposalError::internal_error(
                    "computation task panicked",
                    Some(Box::new(e)),
                )))
            }
        }
    }
}
