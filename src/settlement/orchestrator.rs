use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{Collaborators, LedgerClient, PayoutGateway, PayoutReceipt, PayoutRequest, ProfileClient};
use crate::config::FeeConfig;
use crate::error::{AppError, AppResult, SettlementError};
use crate::settlement::events::{publish_logged, EventPublisher, SettlementEvent};
use crate::settlement::fees::{checked_sum, FeeCalculator};
use crate::settlement::models::*;
use crate::settlement::retry::RetryPolicy;
use crate::settlement::tax::TaxCalculator;
use crate::storage::{RetryQueue, SettlementRepository, Stores};

/// Attempts at a read-modify-write before giving up with `Conflict`
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Run an external call under a deadline
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!("{} exceeded {:?}", what, limit))),
    }
}

/// Stable across retries so the gateway can deduplicate
pub fn payout_idempotency_key(settlement_id: Uuid, net_amount: Decimal) -> String {
    let digest = Sha256::digest(format!("{}:{}", settlement_id, net_amount).as_bytes());
    hex::encode(digest)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSettlementRequest {
    pub user_id: String,
    /// Looked up from the user profile when absent
    pub user_type: Option<UserType>,
    pub period_type: PeriodType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Pulled from the ledger when absent
    pub transactions: Option<Vec<Transaction>>,
    pub created_by: String,
}

/// Drop repeated transaction ids, keeping the first occurrence in order.
/// Every transaction must belong to `user_id`.
fn distinct_transactions(user_id: &str, transactions: Vec<Transaction>) -> AppResult<Vec<Transaction>> {
    if let Some(foreign) = transactions.iter().find(|t| t.user_id != user_id) {
        return Err(AppError::InvalidInput(format!(
            "Transaction {} belongs to {}, not {}",
            foreign.id, foreign.user_id, user_id
        )));
    }

    let supplied = transactions.len();
    let mut seen = HashSet::with_capacity(supplied);
    let distinct: Vec<Transaction> = transactions
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .collect();
    if distinct.len() < supplied {
        warn!(
            "Dropped {} repeated transactions for {}",
            supplied - distinct.len(),
            user_id
        );
    }
    Ok(distinct)
}

/// Result of one trip to the payout gateway
enum PayoutAttempt {
    Paid(PayoutReceipt),
    Rejected(String),
    NotPayable(String),
}

/// Owns every settlement state transition
pub struct SettlementOrchestrator {
    settlements: Arc<dyn SettlementRepository>,
    retry_queue: Arc<dyn RetryQueue>,
    ledger: Arc<dyn LedgerClient>,
    profiles: Arc<dyn ProfileClient>,
    gateway: Arc<dyn PayoutGateway>,
    events: Arc<dyn EventPublisher>,
    fees: FeeCalculator,
    taxes: TaxCalculator,
    retry_policy: RetryPolicy,
    call_timeout: Duration,
}

impl SettlementOrchestrator {
    pub fn new(
        stores: &Stores,
        collaborators: &Collaborators,
        fee_config: FeeConfig,
        retry_policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        let taxes = TaxCalculator::new(fee_config.currency_scale);
        Self {
            settlements: stores.settlements.clone(),
            retry_queue: stores.retry_queue.clone(),
            ledger: collaborators.ledger.clone(),
            profiles: collaborators.profiles.clone(),
            gateway: collaborators.gateway.clone(),
            events: collaborators.events.clone(),
            fees: FeeCalculator::new(fee_config),
            taxes,
            retry_policy,
            call_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Aggregate a user's transactions into a PENDING settlement.
    ///
    /// Nothing is written when the transaction set is empty or a calculation fails.
    /// The ledger is not touched; transactions are tagged only after a successful payout.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_settlement(&self, request: CreateSettlementRequest) -> AppResult<Settlement> {
        let period = SettlementPeriod::new(request.period_type, request.start_date, request.end_date)?;

        let transactions = match request.transactions {
            Some(transactions) => transactions,
            None => {
                with_timeout(
                    self.call_timeout,
                    "ledger query",
                    self.ledger.collect_transactions(&request.user_id, &period),
                )
                .await?
            }
        };

        let transactions = distinct_transactions(&request.user_id, transactions)?;
        if transactions.is_empty() {
            return Err(SettlementError::NoTransactions {
                user_id: request.user_id,
                start: period.start_date,
                end: period.end_date,
            }
            .into());
        }

        let user_type = match request.user_type {
            Some(user_type) => user_type,
            None => {
                with_timeout(
                    self.call_timeout,
                    "user type lookup",
                    self.profiles.get_user_type(&request.user_id),
                )
                .await?
            }
        };
        let tax_profile = with_timeout(
            self.call_timeout,
            "tax profile lookup",
            self.profiles.get_tax_profile(&request.user_id),
        )
        .await?;

        let gross_amount = checked_sum(transactions.iter().map(|t| t.amount), "gross amount")?;
        let fees = self.fees.calculate(gross_amount, user_type, &transactions)?;
        let taxes = self.taxes.calculate(gross_amount, &fees, user_type, &tax_profile)?;
        let net_amount = gross_amount
            .checked_sub(fees.total)
            .and_then(|after_fees| after_fees.checked_sub(taxes.total))
            .ok_or_else(|| SettlementError::Calculation("net amount overflowed".to_string()))?;

        let now = Utc::now();
        let settlement = Settlement {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            user_type,
            period,
            transaction_ids: transactions.into_iter().map(|t| t.id).collect(),
            currency: self.fees.base_currency().to_string(),
            gross_amount,
            fees,
            taxes,
            net_amount,
            status: SettlementStatus::Pending,
            processing: ProcessingInfo::default(),
            audit: AuditInfo {
                created_by: request.created_by,
                ..AuditInfo::default()
            },
            metadata: SettlementMetadata::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        };

        self.settlements.insert(&settlement).await?;

        info!(
            "🧾 Settlement {} created for {}: gross={} fees={} taxes={} net={}",
            settlement.id,
            settlement.user_id,
            settlement.gross_amount,
            settlement.fees.total,
            settlement.taxes.total,
            settlement.net_amount
        );

        self.publish(SettlementEvent::Created {
            settlement_id: settlement.id,
            user_id: settlement.user_id.clone(),
            gross_amount: settlement.gross_amount,
            net_amount: settlement.net_amount,
            created_by: settlement.audit.created_by.clone(),
        })
        .await;

        Ok(settlement)
    }

    /// Pay out a PENDING settlement.
    ///
    /// Exactly one concurrent caller wins the PENDING → PROCESSING transition;
    /// every other caller gets `InvalidState` without mutating anything.
    #[instrument(skip(self, bank_account, approved_by), fields(settlement_id = %id))]
    pub async fn process_settlement(
        self: &Arc<Self>,
        id: Uuid,
        bank_account: Option<BankAccount>,
        approved_by: Option<String>,
    ) -> AppResult<Settlement> {
        let settlement = self
            .update_settlement(id, |s| {
                if s.status != SettlementStatus::Pending {
                    return Err(SettlementError::InvalidState {
                        id: s.id,
                        current: s.status,
                        expected: SettlementStatus::Pending.to_string(),
                    }
                    .into());
                }
                s.transition_to(SettlementStatus::Processing)?;
                s.processing.initiated_at = Some(Utc::now());
                if let Some(approver) = &approved_by {
                    s.audit.approved_by = Some(approver.clone());
                }
                Ok(())
            })
            .await?;

        info!("🔄 Processing settlement {} ({} {})", id, settlement.net_amount, settlement.currency);
        self.drive_payout(settlement, bank_account).await
    }

    /// Re-drive a FAILED settlement that still has automatic attempts left
    #[instrument(skip(self), fields(settlement_id = %id))]
    pub async fn retry_settlement(self: &Arc<Self>, id: Uuid) -> AppResult<Settlement> {
        let policy = self.retry_policy;
        let settlement = self
            .update_settlement(id, |s| {
                if s.status != SettlementStatus::Failed || !policy.can_retry(s.processing.retry_count) {
                    return Err(SettlementError::InvalidState {
                        id: s.id,
                        current: s.status,
                        expected: format!("FAILED with fewer than {} attempts", policy.max_attempts),
                    }
                    .into());
                }
                s.transition_to(SettlementStatus::Processing)?;
                s.processing.initiated_at = Some(Utc::now());
                s.processing.next_retry_at = None;
                Ok(())
            })
            .await?;

        // A manual retry supersedes any queued one
        if let Err(e) = self.retry_queue.remove(id).await {
            warn!("⚠️ Could not clear queued retry for {}: {}", id, e);
        }

        info!(
            "🔁 Retrying settlement {} (previous attempts: {})",
            id, settlement.processing.retry_count
        );
        self.drive_payout(settlement, None).await
    }

    /// PENDING → CANCELLED
    #[instrument(skip(self, reason, cancelled_by), fields(settlement_id = %id))]
    pub async fn cancel_settlement(
        &self,
        id: Uuid,
        reason: &str,
        cancelled_by: Option<String>,
    ) -> AppResult<Settlement> {
        let settlement = self
            .update_settlement(id, |s| {
                if s.status != SettlementStatus::Pending {
                    return Err(SettlementError::InvalidState {
                        id: s.id,
                        current: s.status,
                        expected: SettlementStatus::Pending.to_string(),
                    }
                    .into());
                }
                s.transition_to(SettlementStatus::Cancelled)?;
                s.audit.reviewed_by = cancelled_by.clone();
                s.add_note(format!("Cancelled: {}", reason));
                Ok(())
            })
            .await?;

        info!("🚫 Settlement {} cancelled", id);
        Ok(settlement)
    }

    /// Read, mutate and compare-and-swap until the write lands on the current version.
    ///
    /// `mutate` runs against a fresh copy on every attempt; an error from it aborts
    /// without writing.
    pub async fn update_settlement<F>(&self, id: Uuid, mut mutate: F) -> AppResult<Settlement>
    where
        F: FnMut(&mut Settlement) -> AppResult<()> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .settlements
                .get(id)
                .await?
                .ok_or(SettlementError::NotFound(id))?;

            let mut next = current.clone();
            mutate(&mut next)?;
            next.version = current.version + 1;
            next.updated_at = Utc::now();

            if self.settlements.compare_and_swap(&next, current.version).await? {
                return Ok(next);
            }
            debug!("Version conflict on settlement {}, re-reading", id);
        }

        Err(SettlementError::Conflict(id).into())
    }

    async fn publish(&self, event: SettlementEvent) {
        publish_logged(self.events.as_ref(), self.call_timeout, event).await;
    }

    /// Fail a settlement left in PROCESSING by an attempt that started before
    /// `stalled_before` and never recorded an outcome. The attempt counts towards
    /// the retry budget; the re-drive reuses the payout idempotency key.
    #[instrument(skip(self), fields(settlement_id = %id))]
    pub async fn fail_stalled(&self, id: Uuid, stalled_before: DateTime<Utc>) -> AppResult<Settlement> {
        let message = format!("Payout attempt started before {} never finished", stalled_before);
        let (updated, _) = self
            .record_failure(id, &message, true, Some(stalled_before))
            .await?;
        Ok(updated)
    }

    /// The payout runs on its own task and finishes even if the caller is dropped
    async fn drive_payout(
        self: &Arc<Self>,
        settlement: Settlement,
        bank_account: Option<BankAccount>,
    ) -> AppResult<Settlement> {
        let id = settlement.id;
        let orchestrator = Arc::clone(self);
        tokio::spawn(
            async move { orchestrator.attempt_payout(settlement, bank_account).await }.in_current_span(),
        )
        .await
        .map_err(|e| AppError::Internal(format!("Payout task for settlement {} aborted: {}", id, e)))?
    }

    /// Drive a PROCESSING settlement to its outcome and persist it
    async fn attempt_payout(
        &self,
        settlement: Settlement,
        bank_account: Option<BankAccount>,
    ) -> AppResult<Settlement> {
        let id = settlement.id;
        match self.run_payout(&settlement, bank_account).await {
            Ok(PayoutAttempt::Paid(receipt)) => self.complete(settlement, receipt).await,
            Ok(PayoutAttempt::Rejected(message)) => self.fail(id, message, true).await,
            Ok(PayoutAttempt::NotPayable(message)) => self.fail(id, message, false).await,
            Err(e) => self.fail_unexpected(id, e).await,
        }
    }

    async fn run_payout(
        &self,
        settlement: &Settlement,
        bank_account: Option<BankAccount>,
    ) -> AppResult<PayoutAttempt> {
        if settlement.net_amount <= Decimal::ZERO {
            return Ok(PayoutAttempt::NotPayable(format!(
                "Net amount {} is not payable; deductions exceed gross {}",
                settlement.net_amount, settlement.gross_amount
            )));
        }

        let account = match bank_account {
            Some(account) => account,
            None => with_timeout(
                self.call_timeout,
                "bank account lookup",
                self.profiles.get_bank_account(&settlement.user_id),
            )
            .await?
            .ok_or_else(|| SettlementError::MissingAccount(settlement.user_id.clone()))?,
        };

        let request = PayoutRequest::for_settlement(
            settlement,
            account,
            payout_idempotency_key(settlement.id, settlement.net_amount),
        );

        let outcome = with_timeout(
            self.call_timeout,
            "payout",
            self.gateway.execute_payout(&request),
        )
        .await;

        // A transport error or timeout is a failed attempt like any rejection
        Ok(match outcome {
            Ok(receipt) if receipt.success => PayoutAttempt::Paid(receipt),
            Ok(receipt) => PayoutAttempt::Rejected(
                receipt
                    .error
                    .unwrap_or_else(|| format!("Payout rejected by {}", self.gateway.name())),
            ),
            Err(e) => PayoutAttempt::Rejected(e.to_string()),
        })
    }

    async fn complete(&self, settlement: Settlement, receipt: PayoutReceipt) -> AppResult<Settlement> {
        let id = settlement.id;
        let now = Utc::now();
        let updated = self
            .update_settlement(id, |s| {
                s.processing.payment_id = receipt.payment_id.clone();
                s.processing.external_transaction_id = receipt.transaction_id.clone();
                if s.status == SettlementStatus::Disputed {
                    s.add_note("Payout completed while the settlement was under dispute");
                    return Ok(());
                }
                s.transition_to(SettlementStatus::Completed)?;
                s.processing.completed_at = Some(now);
                s.processing.error_message = None;
                s.processing.next_retry_at = None;
                Ok(())
            })
            .await?;

        let marked = with_timeout(
            self.call_timeout,
            "mark settled",
            self.ledger.mark_settled(&settlement.transaction_ids, id),
        )
        .await;

        if let Err(e) = marked {
            // Money has moved; the settlement stays COMPLETED and the ledger is reconciled by hand
            error!("❌ Settlement {} paid but ledger tagging failed: {}", id, e);
            let note = format!("Ledger mark-settled failed after payout: {}", e);
            if let Err(note_error) = self
                .update_settlement(id, |s| {
                    s.add_note(note.clone());
                    Ok(())
                })
                .await
            {
                error!("❌ Could not record ledger failure on {}: {}", id, note_error);
            }
        }

        if updated.status == SettlementStatus::Completed {
            info!(
                "✅ Settlement {} completed: paid {} {} (payment {:?})",
                id, updated.net_amount, updated.currency, updated.processing.payment_id
            );
            self.publish(SettlementEvent::Completed {
                settlement_id: id,
                user_id: updated.user_id.clone(),
                net_amount: updated.net_amount,
                payment_id: updated.processing.payment_id.clone(),
            })
            .await;
        } else {
            warn!("⚠️ Settlement {} was disputed mid-payout; payout recorded", id);
        }

        Ok(updated)
    }

    /// PROCESSING → FAILED after a gateway attempt, surfaced as a `Payout` error
    async fn fail(&self, id: Uuid, message: String, retryable: bool) -> AppResult<Settlement> {
        let (_, retry_scheduled) = self.record_failure(id, &message, retryable, None).await?;
        Err(SettlementError::Payout {
            id,
            message,
            retry_scheduled,
        }
        .into())
    }

    /// Persist PROCESSING → FAILED. `retryable` attempts count towards the retry
    /// budget and schedule the next one if any remain. With `stalled_before` set,
    /// only an attempt initiated before that instant is failed.
    ///
    /// Returns the stored settlement and whether a retry was queued.
    async fn record_failure(
        &self,
        id: Uuid,
        message: &str,
        retryable: bool,
        stalled_before: Option<DateTime<Utc>>,
    ) -> AppResult<(Settlement, bool)> {
        let policy = self.retry_policy;
        let now = Utc::now();

        let updated = self
            .update_settlement(id, |s| {
                if let Some(cutoff) = stalled_before {
                    let started = s.processing.initiated_at.unwrap_or(s.updated_at);
                    if s.status != SettlementStatus::Processing || started > cutoff {
                        return Err(SettlementError::InvalidState {
                            id: s.id,
                            current: s.status,
                            expected: format!("PROCESSING since before {}", cutoff),
                        }
                        .into());
                    }
                }
                if s.status == SettlementStatus::Disputed {
                    s.add_note(format!("Payout failed while disputed: {}", message));
                    return Ok(());
                }
                s.transition_to(SettlementStatus::Failed)?;
                s.processing.failed_at = Some(now);
                s.processing.error_message = Some(message.to_string());
                if retryable {
                    s.processing.retry_count += 1;
                    s.processing.next_retry_at = policy.next_retry_at(s.processing.retry_count, now);
                } else {
                    s.processing.next_retry_at = None;
                }
                s.add_note(format!(
                    "Payout attempt {} failed: {}",
                    s.processing.retry_count.max(1),
                    message
                ));
                Ok(())
            })
            .await?;

        let mut retry_scheduled = false;
        if updated.status == SettlementStatus::Failed {
            if let Some(run_at) = updated.processing.next_retry_at {
                // The FAILED write is durable first; recovery re-enqueues if this fails
                match self
                    .retry_queue
                    .enqueue(RetryJob {
                        settlement_id: id,
                        attempt: updated.processing.retry_count,
                        run_at,
                        enqueued_at: now,
                    })
                    .await
                {
                    Ok(()) => {
                        retry_scheduled = true;
                        info!(
                            "⏰ Settlement {} failed (attempt {}), retry at {}",
                            id, updated.processing.retry_count, run_at
                        );
                    }
                    Err(e) => error!("❌ Could not enqueue retry for {}: {}", id, e),
                }
            } else {
                warn!(
                    "⚠️ Settlement {} failed after {} attempts; operator action required: {}",
                    id, updated.processing.retry_count, message
                );
            }

            self.publish(SettlementEvent::Failed {
                settlement_id: id,
                user_id: updated.user_id.clone(),
                error: message.to_string(),
                retry_count: updated.processing.retry_count,
                next_retry_at: updated.processing.next_retry_at,
            })
            .await;
        }

        Ok((updated, retry_scheduled))
    }

    /// Force FAILED for an error outside the gateway call, persist it, then surface the error
    async fn fail_unexpected(&self, id: Uuid, cause: AppError) -> AppResult<Settlement> {
        let message = cause.to_string();
        let now = Utc::now();

        let written = self
            .update_settlement(id, |s| {
                if s.status != SettlementStatus::Processing {
                    s.add_note(format!("Processing error in {}: {}", s.status, message));
                    return Ok(());
                }
                s.transition_to(SettlementStatus::Failed)?;
                s.processing.failed_at = Some(now);
                s.processing.error_message = Some(message.clone());
                s.processing.next_retry_at = None;
                s.add_note(format!("Processing aborted: {}", message));
                Ok(())
            })
            .await;

        match written {
            Ok(updated) if updated.status == SettlementStatus::Failed => {
                error!("❌ Settlement {} failed: {}", id, message);
                self.publish(SettlementEvent::Failed {
                    settlement_id: id,
                    user_id: updated.user_id.clone(),
                    error: message.clone(),
                    retry_count: updated.processing.retry_count,
                    next_retry_at: None,
                })
                .await;
            }
            Ok(_) => {}
            Err(e) => error!("❌ Could not persist failure of {} ({}): {}", id, message, e),
        }

        Err(match cause {
            AppError::Settlement(SettlementError::MissingAccount(_)) | AppError::Timeout(_) => cause,
            _ => SettlementError::Unexpected { id, message }.into(),
        })
    }
}
