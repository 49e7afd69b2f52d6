//! The service façade: lifecycle state machine and the public operations.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use originator_common::{
    address, Clock, MsgStatus, MsgToSend, StopController, SystemClock,
};
use originator_delivery::{
    DeliveryWorker, HickoryMxResolver, MxResolver, SendLog, SmtpSettings, WorkerOptions,
};
use originator_store::{Store, StoreConfig};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{OriginatorError, Result};

const ENUM_BATCH_SIZE: usize = 64;

/// Observable service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    StopWaiting = 3,
    StopDeinitializing = 4,
    Stopped = 5,
}

impl ServiceState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::StopWaiting,
            4 => Self::StopDeinitializing,
            5 => Self::Stopped,
            _ => Self::NotStarted,
        }
    }
}

/// Outcome of `remove_idle_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    FoundCannotRemove,
    FoundRemoved,
}

/// Service-level settings installed before the first start.
pub struct ServiceSettings {
    /// Store directory; `None` keeps the queue in memory.
    pub store_dir: Option<PathBuf>,
    pub open_oversize_files_target: usize,
    pub cached_pages_target: usize,
    /// The host's observability callbacks.
    pub send_log: Arc<dyn SendLog>,
    /// Resolver override, for tests and closed environments; the default is
    /// a system-configured resolver honoring the SMTP IP preference.
    pub resolver: Option<Arc<dyn MxResolver>>,
    /// Worker tuning.
    pub worker_options: WorkerOptions,
}

impl ServiceSettings {
    #[must_use]
    pub fn new(store_dir: Option<PathBuf>, send_log: Arc<dyn SendLog>) -> Self {
        Self {
            store_dir,
            open_oversize_files_target: 16,
            cached_pages_target: 1024,
            send_log,
            resolver: None,
            worker_options: WorkerOptions::default(),
        }
    }
}

impl std::fmt::Debug for ServiceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSettings")
            .field("store_dir", &self.store_dir)
            .field("open_oversize_files_target", &self.open_oversize_files_target)
            .field("cached_pages_target", &self.cached_pages_target)
            .finish_non_exhaustive()
    }
}

struct Running {
    store: Store,
    stop_ctl: StopController,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The outbound email originator service.
///
/// Constructed idle; `set_service_settings` and `set_smtp_settings` must be
/// installed before `start`. All operations are callable from any task;
/// the delivery worker runs on its own spawned task.
pub struct Originator {
    state: AtomicU8,
    service_settings: ArcSwapOption<ServiceSettings>,
    smtp_settings: ArcSwapOption<ArcSwap<SmtpSettings>>,
    running: ArcSwapOption<Running>,
    clock: Arc<dyn Clock>,
}

impl Default for Originator {
    fn default() -> Self {
        Self::new()
    }
}

impl Originator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ServiceState::NotStarted as u8),
            service_settings: ArcSwapOption::empty(),
            smtp_settings: ArcSwapOption::empty(),
            running: ArcSwapOption::empty(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| {
                OriginatorError::IllegalState(format!(
                    "expected service state {from:?}, found {:?}",
                    ServiceState::from_u8(actual)
                ))
            })
    }

    /// Install service settings. Permitted only before the first start.
    pub fn set_service_settings(&self, settings: ServiceSettings) -> Result<()> {
        if self.service_state() != ServiceState::NotStarted {
            return Err(OriginatorError::IllegalState(
                "service settings may only be set before the first start".to_string(),
            ));
        }
        self.service_settings.store(Some(Arc::new(settings)));
        Ok(())
    }

    /// Install or replace SMTP settings. Readers snapshot per operation, so
    /// a replacement applies from the next attempt on.
    pub fn set_smtp_settings(&self, settings: SmtpSettings) {
        let settings = Arc::new(settings);
        match &*self.smtp_settings.load() {
            Some(anchor) => anchor.store(settings),
            None => {
                self.smtp_settings
                    .store(Some(Arc::new(ArcSwap::new(settings))));
            }
        }
    }

    /// Start the service: open the store, create the storage parent, run
    /// crash recovery and launch the delivery worker.
    ///
    /// Requires `NotStarted` or `Stopped`, and both settings installed.
    /// Must be called within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        let prev = self.service_state();
        if prev != ServiceState::NotStarted && prev != ServiceState::Stopped {
            return Err(OriginatorError::IllegalState(format!(
                "start requires NotStarted or Stopped, found {prev:?}"
            )));
        }
        self.transition(prev, ServiceState::Starting)?;

        let result = self.start_inner().await;
        match result {
            Ok(()) => {
                self.transition(ServiceState::Starting, ServiceState::Started)?;
                info!("originator started");
                Ok(())
            }
            Err(e) => {
                // Roll the state word back so the host can fix settings and retry.
                self.state.store(prev as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let service = self.service_settings.load_full().ok_or_else(|| {
            OriginatorError::IllegalState("service settings not installed".to_string())
        })?;
        let smtp_anchor = self.smtp_settings.load_full().ok_or_else(|| {
            OriginatorError::IllegalState("SMTP settings not installed".to_string())
        })?;

        let store = Store::open(StoreConfig {
            dir: service.store_dir.clone(),
            open_oversize_files_target: service.open_oversize_files_target,
            cached_pages_target: service.cached_pages_target,
        })
        .await?;

        // The singleton storage parent is created once, exclusively.
        store
            .run_tx_exclusive(|tx| Ok(tx.ensure_storage_parent()))
            .await?;

        let resolver: Arc<dyn MxResolver> = match &service.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(HickoryMxResolver::new(
                smtp_anchor.load().ip_ver_preference,
            )),
        };

        let stop_ctl = StopController::new();
        let worker = DeliveryWorker::new(
            store.clone(),
            resolver,
            Arc::clone(&smtp_anchor),
            Arc::clone(&service.send_log),
            Arc::clone(&self.clock),
            stop_ctl.token(),
            service.worker_options.clone(),
        );
        let handle = tokio::spawn(worker.run());

        self.running.store(Some(Arc::new(Running {
            store,
            stop_ctl,
            worker: tokio::sync::Mutex::new(Some(handle)),
        })));
        Ok(())
    }

    fn running(&self) -> Result<Arc<Running>> {
        if self.service_state() != ServiceState::Started {
            return Err(OriginatorError::IllegalState(format!(
                "operation requires Started, found {:?}",
                self.service_state()
            )));
        }
        self.running
            .load_full()
            .ok_or_else(|| OriginatorError::Internal("service context missing".to_string()))
    }

    /// Queue a message. The store assigns its identity; the returned value
    /// is also written back into callbacks' `entity_id`.
    pub async fn send_message(&self, msg: MsgToSend) -> Result<u64> {
        let running = self.running()?;

        if msg.entity_id != 0 {
            return Err(OriginatorError::InvalidArgument(
                "entity_id must be zero for a new message".to_string(),
            ));
        }
        if msg.status != MsgStatus::NonFinalIdle {
            return Err(OriginatorError::InvalidArgument(
                "a new message must be NonFinalIdle".to_string(),
            ));
        }
        if !address::is_valid_addr_spec(&msg.from_address) {
            return Err(OriginatorError::InvalidArgument(format!(
                "invalid from address: '{}'",
                msg.from_address
            )));
        }
        if !address::is_valid_domain(&msg.to_domain) {
            return Err(OriginatorError::InvalidArgument(format!(
                "invalid recipient domain: '{}'",
                msg.to_domain
            )));
        }
        if msg.pending_mailboxes.is_empty() {
            return Err(OriginatorError::InvalidArgument(
                "a message needs at least one recipient".to_string(),
            ));
        }
        for mailbox in &msg.pending_mailboxes {
            if !address::is_valid_addr_spec(mailbox) {
                return Err(OriginatorError::InvalidArgument(format!(
                    "invalid recipient mailbox: '{mailbox}'"
                )));
            }
        }

        let id = running.store.run_tx(|tx| tx.insert(msg)).await?;
        Ok(id)
    }

    /// Iterate all persisted messages in batches; each batch is delivered
    /// after its transaction committed. The callback returns `false` to
    /// cancel the iteration.
    pub async fn enum_messages(
        &self,
        callback: impl FnMut(&[MsgToSend]) -> bool,
    ) -> Result<()> {
        let running = self.running()?;
        running
            .store
            .process_in_batches(ENUM_BATCH_SIZE, callback)
            .await?;
        Ok(())
    }

    /// Remove a message, permitted only while it is idle. An in-flight or
    /// finalised message is reported, not removed.
    pub async fn remove_idle_message(&self, entity_id: u64) -> Result<RemoveOutcome> {
        let running = self.running()?;
        let outcome = running
            .store
            .run_tx(|tx| {
                let Some(msg) = tx.get(entity_id) else {
                    return Ok(RemoveOutcome::NotFound);
                };
                if msg.status != MsgStatus::NonFinalIdle {
                    return Ok(RemoveOutcome::FoundCannotRemove);
                }
                tx.remove(entity_id)?;
                Ok(RemoveOutcome::FoundRemoved)
            })
            .await?;
        Ok(outcome)
    }

    /// Signal the stop controller. Requires `Started`.
    pub fn begin_stop(&self) -> Result<()> {
        self.transition(ServiceState::Started, ServiceState::StopWaiting)?;
        if let Some(running) = self.running.load_full() {
            running.stop_ctl.stop("stop requested");
        }
        Ok(())
    }

    /// Wait up to `wait_ms` for the worker to finish. The first caller to
    /// observe completion performs teardown (closes the store); concurrent
    /// callers spin until teardown finished. Returns whether the service
    /// is fully stopped.
    pub async fn wait_stop(&self, wait_ms: u64) -> Result<bool> {
        match self.service_state() {
            ServiceState::StopWaiting => {}
            ServiceState::StopDeinitializing => {
                self.spin_until_stopped().await;
                return Ok(true);
            }
            ServiceState::Stopped => return Ok(true),
            other => {
                return Err(OriginatorError::IllegalState(format!(
                    "wait_stop requires a stopping service, found {other:?}"
                )))
            }
        }

        let Some(running) = self.running.load_full() else {
            return Err(OriginatorError::Internal("service context missing".to_string()));
        };

        let finished = {
            let mut worker = running.worker.lock().await;
            match worker.as_mut() {
                None => true,
                Some(handle) => {
                    match tokio::time::timeout(Duration::from_millis(wait_ms), &mut *handle).await {
                        Ok(join) => {
                            if let Err(e) = join {
                                tracing::error!(error = %e, "delivery worker panicked");
                            }
                            *worker = None;
                            true
                        }
                        Err(_) => false,
                    }
                }
            }
        };

        if !finished {
            return Ok(false);
        }

        if self
            .state
            .compare_exchange(
                ServiceState::StopWaiting as u8,
                ServiceState::StopDeinitializing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            // This caller tears down: drop the store handle.
            self.running.store(None);
            self.state
                .store(ServiceState::Stopped as u8, Ordering::SeqCst);
            info!("originator stopped");
        } else {
            self.spin_until_stopped().await;
        }
        Ok(true)
    }

    async fn spin_until_stopped(&self) {
        while self.service_state() != ServiceState::Stopped {
            tokio::task::yield_now().await;
        }
    }
}
