//! Outbound dispatch: the scheduled/retry sweep and immediate sends.
//!
//! A sweep releases stale claims, loads every due fax and processes them one
//! at a time. Each fax is claimed with a compare-and-swap before the carrier
//! is called, so overlapping sweeps never attempt the same fax twice. A failure
//! on one fax is recorded as its outcome and never stops the batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::renderer::DocumentRenderer;
use crate::dispatch::transport::FaxTransport;
use crate::error::{DatabaseError, DispatchError};
use crate::fax::model::{
    FaxStatus, NewOutboundFax, OutboundFax, OutboundPatch, UsageKind, usage_period,
};
use crate::notify::{Notice, Notifier};
use crate::store::Database;

/// Result of processing one fax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepOutcome {
    Success,
    RetryScheduled,
    Failed,
    /// Unexpected error while processing (e.g. the database write failed).
    Error,
    /// Another sweep claimed the fax first.
    Skipped,
}

/// Per-fax line of a sweep report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaxOutcome {
    pub fax_id: Uuid,
    pub outcome: SweepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Number of due faxes found.
    pub considered: usize,
    /// Stale claims returned to `scheduled` before the due query.
    pub released: usize,
    pub outcomes: Vec<FaxOutcome>,
}

impl SweepReport {
    pub fn count(&self, outcome: SweepOutcome) -> usize {
        self.outcomes.iter().filter(|o| o.outcome == outcome).count()
    }
}

/// Runs delivery attempts against the injected store, carrier and renderer.
pub struct DispatchLoop {
    store: Arc<dyn Database>,
    transport: Arc<dyn FaxTransport>,
    renderer: Arc<dyn DocumentRenderer>,
    notifier: Option<Arc<dyn Notifier>>,
    claim_timeout: Duration,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn FaxTransport>,
        renderer: Arc<dyn DocumentRenderer>,
        claim_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            renderer,
            notifier: None,
            claim_timeout,
        }
    }

    /// Builder: send terminal failures to a notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Process every fax due at `now`.
    ///
    /// Only fails when the due set cannot be loaded; per-fax problems are
    /// reported in the outcome list.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DispatchError> {
        let mut report = SweepReport::default();

        let timeout =
            chrono::Duration::from_std(self.claim_timeout).unwrap_or(chrono::Duration::zero());
        let stale_before = now - timeout;
        match self.store.release_stale_claims(stale_before).await {
            Ok(n) => report.released = n,
            Err(e) => warn!(error = %e, "Failed to release stale claims"),
        }

        let due = self
            .store
            .list_due_outbound(now)
            .await
            .map_err(DispatchError::DueQuery)?;
        report.considered = due.len();
        debug!(due = due.len(), carrier = self.transport.name(), "Dispatch sweep started");

        for fax in due {
            let outcome = match self.store.claim_outbound(fax.id, FaxStatus::Scheduled, now).await {
                Ok(true) => self.attempt_or_error(&fax, now).await,
                Ok(false) => {
                    debug!(fax_id = %fax.id, "Fax already claimed, skipping");
                    FaxOutcome {
                        fax_id: fax.id,
                        outcome: SweepOutcome::Skipped,
                        detail: None,
                    }
                }
                Err(e) => {
                    error!(fax_id = %fax.id, error = %e, "Failed to claim fax");
                    FaxOutcome {
                        fax_id: fax.id,
                        outcome: SweepOutcome::Error,
                        detail: Some(e.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        info!(
            considered = report.considered,
            released = report.released,
            success = report.count(SweepOutcome::Success),
            retry_scheduled = report.count(SweepOutcome::RetryScheduled),
            failed = report.count(SweepOutcome::Failed),
            errors = report.count(SweepOutcome::Error),
            skipped = report.count(SweepOutcome::Skipped),
            "Dispatch sweep finished"
        );
        Ok(report)
    }

    /// Create an outbound fax. Unscheduled faxes get one immediate attempt.
    pub async fn create_outbound(&self, request: NewOutboundFax) -> Result<OutboundFax, DispatchError> {
        request.validate().map_err(DispatchError::Validation)?;
        let fax = request.into_fax(Utc::now());
        self.store.insert_outbound(&fax).await?;
        info!(fax_id = %fax.id, status = %fax.status, destination = %fax.destination, "Outbound fax created");

        if fax.status == FaxStatus::Pending {
            self.send_now(fax.id).await?;
        }
        self.get_outbound(fax.id).await
    }

    /// Attempt a pending fax right away, with the same retry rules as the sweep.
    pub async fn send_now(&self, id: Uuid) -> Result<FaxOutcome, DispatchError> {
        let fax = self.get_outbound(id).await?;
        if fax.status != FaxStatus::Pending {
            return Err(DispatchError::NotSendable {
                id,
                status: fax.status.to_string(),
            });
        }

        let now = Utc::now();
        if !self.store.claim_outbound(id, FaxStatus::Pending, now).await? {
            let status = match self.store.get_outbound(id).await? {
                Some(current) => current.status.to_string(),
                None => return Err(DispatchError::NotFound { id }),
            };
            return Err(DispatchError::NotSendable { id, status });
        }
        Ok(self.attempt_or_error(&fax, now).await)
    }

    pub async fn get_outbound(&self, id: Uuid) -> Result<OutboundFax, DispatchError> {
        self.store
            .get_outbound(id)
            .await?
            .ok_or(DispatchError::NotFound { id })
    }

    /// Manual edit of status, schedule, notes or assignee.
    pub async fn update_outbound(
        &self,
        id: Uuid,
        patch: OutboundPatch,
    ) -> Result<OutboundFax, DispatchError> {
        let mut fax = self.get_outbound(id).await?;
        let read_status = fax.status;
        patch
            .apply(&mut fax, Utc::now())
            .map_err(DispatchError::Validation)?;
        if !self.store.update_outbound(&fax, read_status).await? {
            let status = match self.store.get_outbound(id).await? {
                Some(current) => current.status.to_string(),
                None => return Err(DispatchError::NotFound { id }),
            };
            warn!(fax_id = %id, expected = %read_status, status = %status, "Outbound edit lost a race");
            return Err(DispatchError::Conflict { id, status });
        }
        info!(fax_id = %id, status = %fax.status, "Outbound fax edited");
        Ok(fax)
    }

    /// Number of faxes a sweep at `now` would consider.
    pub async fn count_due(&self, now: DateTime<Utc>) -> Result<i64, DispatchError> {
        Ok(self.store.count_due_outbound(now).await?)
    }

    async fn attempt_or_error(&self, fax: &OutboundFax, now: DateTime<Utc>) -> FaxOutcome {
        match self.attempt(fax, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(fax_id = %fax.id, error = %e, "Dispatch attempt errored");
                FaxOutcome {
                    fax_id: fax.id,
                    outcome: SweepOutcome::Error,
                    detail: Some(e.to_string()),
                }
            }
        }
    }

    /// One delivery attempt on a claimed fax.
    async fn attempt(&self, fax: &OutboundFax, now: DateTime<Utc>) -> Result<FaxOutcome, DatabaseError> {
        // A render failure is a failed attempt, same as a carrier failure.
        let delivery = match self.renderer.render(&fax.document).await {
            Ok(rendered) => self
                .transport
                .send(&fax.destination, &rendered)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match delivery {
            Ok(transport_id) => {
                self.store.mark_outbound_sent(fax.id, now, &transport_id).await?;
                let (year, month) = usage_period(now);
                if let Err(e) = self.store.increment_usage(UsageKind::Sent, year, month).await {
                    warn!(fax_id = %fax.id, error = %e, "Failed to bump sent counter");
                }
                info!(fax_id = %fax.id, transport_id = %transport_id, outcome = "success", "Fax delivered");
                Ok(FaxOutcome {
                    fax_id: fax.id,
                    outcome: SweepOutcome::Success,
                    detail: Some(transport_id),
                })
            }
            Err(reason) => match fax.retry.next_attempt(fax.retry_count, now) {
                Err(range) => {
                    // No representable retry time: terminal.
                    let reason = format!("{reason}; {range}");
                    self.store.mark_outbound_failed(fax.id, &reason, now).await?;
                    error!(fax_id = %fax.id, error = %reason, "Retry time out of range, fax failed");
                    Ok(FaxOutcome {
                        fax_id: fax.id,
                        outcome: SweepOutcome::Error,
                        detail: Some(reason),
                    })
                }
                Ok(Some(next_at)) => {
                    let retry_count = fax.retry_count + 1;
                    self.store
                        .reschedule_outbound(fax.id, retry_count, next_at, &reason)
                        .await?;
                    warn!(
                        fax_id = %fax.id,
                        retry_count,
                        next_at = %next_at,
                        error = %reason,
                        outcome = "retry_scheduled",
                        "Fax delivery failed, retry scheduled"
                    );
                    Ok(FaxOutcome {
                        fax_id: fax.id,
                        outcome: SweepOutcome::RetryScheduled,
                        detail: Some(reason),
                    })
                }
                Ok(None) => {
                    self.store.mark_outbound_failed(fax.id, &reason, now).await?;
                    warn!(
                        fax_id = %fax.id,
                        retry_count = fax.retry_count,
                        error = %reason,
                        outcome = "failed",
                        "Fax delivery failed permanently"
                    );
                    if let Some(notifier) = &self.notifier {
                        notifier.notify(Notice::OutboundFailed {
                            fax_id: fax.id,
                            destination: fax.destination.clone(),
                            attempts: fax.retry_count + 1,
                            error: reason.clone(),
                        });
                    }
                    Ok(FaxOutcome {
                        fax_id: fax.id,
                        outcome: SweepOutcome::Failed,
                        detail: Some(reason),
                    })
                }
            },
        }
    }
}

/// Run sweeps on a cron schedule until the task is aborted.
pub fn spawn_sweep_ticker(
    dispatch: Arc<DispatchLoop>,
    schedule: cron::Schedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Sweep schedule has no upcoming fire time, ticker stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = dispatch.run_sweep(Utc::now()).await {
                error!(error = %e, "Scheduled dispatch sweep failed");
            }
        }
    })
}
