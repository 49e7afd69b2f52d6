//! The delivery worker: crash recovery, due-message scanning, attempt
//! orchestration and outcome bookkeeping.
//!
//! The SMTP dialog always runs outside any store transaction; the outcome
//! is applied in a separate result transaction and callbacks fire after it
//! commits.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use originator_common::{
    Clock, FailureKind, MailboxResult, MailboxState, MsgStatus, MsgToSend, SendStage, Severity,
    StopToken, TlsAssurance,
};
use originator_smtp::{
    attempt::{run_attempt, AttemptReport, AttemptSpec, MailboxDisposition, MxTarget},
    AuthMechanism, RelayAuth, SendError,
};
use originator_store::{Store, StoreError};
use tracing::{debug, error, info, warn};

use crate::{
    config::{RelayAuthType, SmtpSettings},
    dns::{DnsError, MxResolver},
    log::SendLog,
    retry::next_retry_delay,
};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Idle poll interval between due-message scans.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Single delivery worker, cooperatively stopped.
pub struct DeliveryWorker {
    store: Store,
    resolver: Arc<dyn MxResolver>,
    settings: Arc<ArcSwap<SmtpSettings>>,
    send_log: Arc<dyn SendLog>,
    clock: Arc<dyn Clock>,
    stop: StopToken,
    options: WorkerOptions,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        store: Store,
        resolver: Arc<dyn MxResolver>,
        settings: Arc<ArcSwap<SmtpSettings>>,
        send_log: Arc<dyn SendLog>,
        clock: Arc<dyn Clock>,
        stop: StopToken,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            settings,
            send_log,
            clock,
            stop,
            options,
        }
    }

    /// Recover, then scan until stopped.
    pub async fn run(self) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "crash recovery failed");
            self.send_log
                .log_event(Severity::Error, &format!("crash recovery failed: {e}"));
        }

        let mut stop = self.stop.clone();
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "delivery pass failed");
                        self.send_log
                            .log_event(Severity::Error, &format!("delivery pass failed: {e}"));
                    }
                    if self.stop.is_stopping() {
                        break;
                    }
                }
                () = stop.stopped() => break,
            }
        }
        debug!("delivery worker exited");
    }

    /// Requeue messages left mid-send by a crash and report them once.
    async fn recover(&self) -> Result<(), StoreError> {
        let reset = self
            .store
            .run_tx(|tx| {
                let stuck = tx.select(|m| m.status == MsgStatus::NonFinalSending);
                let mut reset = Vec::with_capacity(stuck.len());
                for mut msg in stuck {
                    msg.status = MsgStatus::NonFinalIdle;
                    tx.update(msg.clone())?;
                    reset.push(msg);
                }
                Ok(reset)
            })
            .await?;

        if !reset.is_empty() {
            info!(count = reset.len(), "recovered messages left in-flight");
            self.send_log.on_reset(&reset);
        }
        Ok(())
    }

    /// One scan: due idle messages ordered by attempt time, grouped by
    /// recipient domain so same-domain messages run back to back.
    async fn pass(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut due = self
            .store
            .run_read(|tx| {
                tx.select(|m| m.status == MsgStatus::NonFinalIdle && m.next_attempt_time <= now)
            })
            .await;
        if due.is_empty() {
            return Ok(());
        }
        due.sort_by_key(|m| m.next_attempt_time);

        let mut domain_order: Vec<String> = Vec::new();
        for msg in &due {
            if !domain_order.iter().any(|d| d == &msg.to_domain) {
                domain_order.push(msg.to_domain.clone());
            }
        }

        for domain in domain_order {
            for msg in due.iter().filter(|m| m.to_domain == domain) {
                if self.stop.is_stopping() {
                    return Ok(());
                }
                self.deliver_one(msg.entity_id).await?;
            }
        }
        Ok(())
    }

    /// Claim, attempt, record, report: the full lifecycle of one attempt.
    async fn deliver_one(&self, entity_id: u64) -> Result<(), StoreError> {
        // Short claim transaction.
        let claimed = self
            .store
            .run_tx(|tx| {
                let Some(mut msg) = tx.get(entity_id) else {
                    return Ok(None);
                };
                if msg.status != MsgStatus::NonFinalIdle {
                    return Ok(None);
                }
                msg.status = MsgStatus::NonFinalSending;
                tx.update(msg.clone())?;
                Ok(Some(msg))
            })
            .await?;
        let Some(claimed) = claimed else {
            return Ok(());
        };

        self.send_log.on_attempt(&claimed);

        // The dialog runs outside any transaction.
        let settings = self.settings.load_full();
        let report = match self.resolve_targets(&settings, &claimed).await {
            Ok(targets) => {
                let spec = build_spec(&settings, &claimed);
                run_attempt(&spec, &targets, Some(&self.stop)).await
            }
            Err(failure) => AttemptReport {
                mx: String::new(),
                tls_achieved: TlsAssurance::NoTls,
                outcomes: Vec::new(),
                failure: Some(failure),
            },
        };

        if let Some(failure) = &report.failure {
            if failure.kind == FailureKind::Cancelled {
                debug!(entity_id, "attempt cancelled by stop request");
            } else {
                warn!(entity_id, stage = %failure.stage, error = %failure, "attempt failed");
                self.send_log.log_event(
                    Severity::Warning,
                    &format!("message {entity_id}: attempt failed at {}: {failure}", failure.stage),
                );
            }
        }

        // Result transaction.
        let now = self.clock.now();
        let (updated, attempt_results) = self
            .store
            .run_tx(|tx| {
                let mut msg = tx.get(entity_id).ok_or(StoreError::NotFound(entity_id))?;
                let results = apply_outcome(&mut msg, &report, now);
                tx.update(msg.clone())?;
                Ok((msg, results))
            })
            .await?;

        self.send_log
            .on_result(&updated, &attempt_results, report.tls_achieved);

        if updated.status.is_final() {
            info!(entity_id, status = ?updated.status, "message finalised");
            self.send_log.log_event(
                Severity::Info,
                &format!("message {entity_id} finalised: {:?}", updated.status),
            );
        }
        Ok(())
    }

    /// Resolve either the relay or the recipient domain's exchangers into
    /// dialable targets.
    async fn resolve_targets(
        &self,
        settings: &SmtpSettings,
        msg: &MsgToSend,
    ) -> Result<Vec<MxTarget>, SendError> {
        if settings.use_relay {
            let addrs = self
                .resolver
                .resolve_host(&settings.relay_host)
                .await
                .map_err(lookup_error)?;
            return Ok(vec![MxTarget {
                host: settings.relay_host.clone(),
                port: settings.relay_port,
                addrs,
            }]);
        }

        let exchangers = self
            .resolver
            .resolve_domain(&msg.to_domain)
            .await
            .map_err(lookup_error)?;

        let mut targets = Vec::with_capacity(exchangers.len());
        for mx in exchangers {
            match self.resolver.resolve_host(&mx.host).await {
                Ok(addrs) => targets.push(MxTarget {
                    host: mx.host,
                    port: mx.port,
                    addrs,
                }),
                Err(e) => debug!(host = %mx.host, error = %e, "skipping unresolvable exchanger"),
            }
        }
        if targets.is_empty() {
            return Err(SendError {
                stage: SendStage::Lookup,
                kind: FailureKind::Resolver,
                permanent: false,
                mx: String::new(),
                reply: None,
                desc: format!("no exchanger host for {} resolved", msg.to_domain),
            });
        }
        Ok(targets)
    }
}

fn lookup_error(e: DnsError) -> SendError {
    SendError {
        stage: SendStage::Lookup,
        kind: FailureKind::Resolver,
        permanent: !e.is_temporary(),
        mx: String::new(),
        reply: None,
        desc: e.to_string(),
    }
}

fn build_spec<'a>(settings: &SmtpSettings, msg: &'a MsgToSend) -> AttemptSpec<'a> {
    let mut match_domains = Vec::with_capacity(1 + msg.additional_match_domains.len());
    match_domains.push(msg.to_domain.clone());
    match_domains.extend(msg.additional_match_domains.iter().cloned());

    let tls_requirement = if settings.use_relay {
        msg.tls_requirement.max(settings.relay_tls_requirement)
    } else {
        msg.tls_requirement
    };

    let auth = if settings.use_relay {
        relay_auth(settings)
    } else {
        None
    };

    AttemptSpec {
        ehlo_name: settings.sender_computer_name.clone(),
        from_address: msg.from_address.clone(),
        mailboxes: msg.pending_mailboxes.clone(),
        content: &msg.content_part1,
        match_domains,
        tls_requirement,
        implicit_tls: settings.use_relay && settings.relay_implicit_tls,
        auth,
        budget_secs: msg.send_budget_secs(),
    }
}

fn relay_auth(settings: &SmtpSettings) -> Option<RelayAuth> {
    let mechanism = match settings.relay_auth_type {
        RelayAuthType::None => return None,
        RelayAuthType::Plain => AuthMechanism::Plain,
        RelayAuthType::Login => AuthMechanism::Login,
        RelayAuthType::CramMd5 => AuthMechanism::CramMd5,
    };
    Some(RelayAuth {
        mechanism,
        username: settings.relay_username.clone(),
        password: settings.relay_password.clone(),
    })
}

/// Fold one attempt's report into the message record.
///
/// Returns the per-attempt result vector for `on_result`, which includes
/// non-terminal entries; only terminal records are persisted on the message.
pub fn apply_outcome(
    msg: &mut MsgToSend,
    report: &AttemptReport,
    now: DateTime<Utc>,
) -> Vec<MailboxResult> {
    fn record(
        msg: &mut MsgToSend,
        attempt_results: &mut Vec<MailboxResult>,
        progressed: &mut bool,
        result: MailboxResult,
    ) {
        if result.state.is_terminal() {
            msg.pending_mailboxes.retain(|m| m != &result.mailbox);
            msg.mailbox_results.push(result.clone());
            *progressed = true;
        }
        attempt_results.push(result);
    }

    let mut attempt_results = Vec::new();
    let mut progressed = false;

    // Per-recipient decisions reached during the dialog.
    for outcome in &report.outcomes {
        let (state, success_mx, failure) = match &outcome.disposition {
            MailboxDisposition::Succeeded { mx } => {
                (MailboxState::Succeeded, mx.clone(), None)
            }
            MailboxDisposition::TempFailed(f) => {
                (MailboxState::TempFailed, String::new(), Some(f.clone()))
            }
            MailboxDisposition::PermFailed(f) => {
                (MailboxState::PermFailed, String::new(), Some(f.clone()))
            }
        };
        record(
            msg,
            &mut attempt_results,
            &mut progressed,
            MailboxResult {
                time: now,
                mailbox: outcome.mailbox.clone(),
                success_mx,
                state,
                failure,
            },
        );
    }

    // A cancelled attempt is not counted: requeue and let the next start
    // (or the restart) pick the message up again.
    if report
        .failure
        .as_ref()
        .is_some_and(|f| f.kind == FailureKind::Cancelled)
    {
        msg.status = MsgStatus::NonFinalIdle;
        if progressed {
            msg.attempts_since_progress = 0;
        }
        return attempt_results;
    }

    // A permanent message-level failure finalises everyone still pending.
    if let Some(failure) = report.failure.as_ref().filter(|f| f.permanent) {
        let shared = failure.to_failure();
        for mailbox in std::mem::take(&mut msg.pending_mailboxes) {
            record(
                msg,
                &mut attempt_results,
                &mut progressed,
                MailboxResult {
                    time: now,
                    mailbox,
                    success_mx: String::new(),
                    state: MailboxState::PermFailed,
                    failure: Some(shared.clone()),
                },
            );
        }
    }

    if progressed {
        msg.attempts_since_progress = 0;
    }

    if msg.pending_mailboxes.is_empty() {
        let delivered = msg
            .mailbox_results
            .iter()
            .any(|r| r.state == MailboxState::Succeeded);
        msg.status = if delivered {
            MsgStatus::FinalDelivered
        } else {
            MsgStatus::FinalAborted
        };
        return attempt_results;
    }

    // Recipients remain: schedule the retry, or give up.
    msg.attempts_since_progress += 1;
    match next_retry_delay(msg.retry_schedule(), msg.attempts_since_progress) {
        Some(delay) => {
            msg.status = MsgStatus::NonFinalIdle;
            msg.next_attempt_time = now + delay;
        }
        None => {
            let shared = report.failure.as_ref().map(SendError::to_failure);
            for mailbox in std::mem::take(&mut msg.pending_mailboxes) {
                let result = MailboxResult {
                    time: now,
                    mailbox,
                    success_mx: String::new(),
                    state: MailboxState::GaveUp,
                    failure: shared.clone(),
                };
                msg.mailbox_results.push(result.clone());
                attempt_results.push(result);
            }
            msg.status = MsgStatus::FinalGaveUp;
        }
    }
    attempt_results
}
