//! Call-control service
//!
//! Wires the connection manager, dispatcher, registry, gateway and snapshot
//! engine together and owns their background tasks:
//!
//! ```rust,no_run
//! use rvoip_esl_core::{CallControlService, EslConfig};
//!
//! # async fn example() -> rvoip_esl_core::EslResult<()> {
//! let service = CallControlService::new(EslConfig::new("127.0.0.1", 8021, "ClueCon"));
//! service.start().await?;
//!
//! let mut calls = service.subscribe_calls();
//! let call_id = service.gateway().originate("1000", "default", 30).await?;
//! while let Ok(event) = calls.recv().await {
//!     println!("{} {:?}", event.call_id, event.kind);
//! }
//! # let _ = call_id;
//! service.shutdown().await
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::CallRecord;
use crate::cdr::{CdrForwarder, CdrSink, LoggingCdrSink};
use crate::config::EslConfig;
use crate::connection::{ConnectionManager, ConnectionSignal};
use crate::dispatcher::{BillingLegPredicate, ChannelMarkerBillingLeg, DispatchStats, EventDispatcher};
use crate::error::{EslError, EslResult};
use crate::events::{CallEvent, EventHub};
use crate::gateway::CommandGateway;
use crate::jobs::JobTable;
use crate::protocol::EslEvent;
use crate::registry::CallRegistry;
use crate::snapshot::{ActiveCallsSnapshot, SnapshotEngine};
use crate::stats::{StatsHistory, StatsSnapshot};

/// Interval of the expired-job sweep
const JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for queued CDR updates to reach the sink
const CDR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One switch connection with its call model and command surface
pub struct CallControlService {
    config: EslConfig,
    connection: Arc<ConnectionManager>,
    registry: Arc<CallRegistry>,
    jobs: Arc<JobTable>,
    hub: EventHub,
    gateway: CommandGateway,
    dispatcher: Arc<EventDispatcher>,
    snapshots: Arc<SnapshotEngine>,
    events_rx: Mutex<Option<mpsc::Receiver<EslEvent>>>,
    cdr_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CallControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallControlService")
            .field("addr", &self.config.addr())
            .field("connection", &self.connection.state())
            .field("calls", &self.registry.len())
            .finish()
    }
}

impl CallControlService {
    /// Service with a logging-only CDR sink and the default billing-leg rule
    pub fn new(config: EslConfig) -> Self {
        let billing = Arc::new(ChannelMarkerBillingLeg::new(&config.billing));
        Self::with_collaborators(config, Arc::new(LoggingCdrSink), billing)
    }

    /// Service with a caller-supplied CDR sink and billing-leg predicate
    pub fn with_collaborators(
        config: EslConfig,
        cdr_sink: Arc<dyn CdrSink>,
        billing: Arc<dyn BillingLegPredicate>,
    ) -> Self {
        let (connection, events_rx) = ConnectionManager::new(config.clone());
        let registry = Arc::new(CallRegistry::new());
        let jobs = Arc::new(JobTable::new());
        let hub = EventHub::new(config.broadcast_capacity);
        let gateway = CommandGateway::new(
            Arc::clone(&connection),
            Arc::clone(&jobs),
            Arc::clone(&registry),
            &config,
        );

        let (cdr, cdr_task) = CdrForwarder::spawn(cdr_sink, config.cdr_queue_capacity);
        let dispatcher = Arc::new(
            EventDispatcher::new(Arc::clone(&registry), Arc::clone(&jobs), hub.clone())
                .with_cdr(cdr)
                .with_billing_predicate(billing),
        );
        let snapshots = Arc::new(SnapshotEngine::new(
            gateway.clone(),
            Arc::clone(&registry),
            hub.clone(),
            config.snapshot.clone(),
        ));

        Self {
            config,
            connection,
            registry,
            jobs,
            hub,
            gateway,
            dispatcher,
            snapshots,
            events_rx: Mutex::new(Some(events_rx)),
            cdr_task: Mutex::new(Some(cdr_task)),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the background tasks and connect.
    ///
    /// A failed first connect is returned, the manager keeps retrying in the
    /// background.
    pub async fn start(&self) -> EslResult<()> {
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| EslError::internal("service already started"))?;

        info!(addr = %self.config.addr(), "Starting call-control service");
        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(
                Arc::clone(&self.dispatcher).run(events_rx, self.cancel.child_token()),
            ));
            tasks.push(tokio::spawn(
                Arc::clone(&self.snapshots).run(self.cancel.child_token()),
            ));
            tasks.push(tokio::spawn(sweep_jobs(
                Arc::clone(&self.jobs),
                self.cancel.child_token(),
            )));
        }

        self.connection.connect().await
    }

    /// Stop the background tasks and close the connection.
    ///
    /// Queued CDR updates are handed to the sink for up to five seconds
    /// before the CDR task is aborted.
    pub async fn shutdown(&self) -> EslResult<()> {
        info!("Shutting down call-control service");
        self.cancel.cancel();
        self.connection.disconnect().await?;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        // Also covers a service that was never started
        self.dispatcher.release_cdr();
        let cdr_task = self.cdr_task.lock().take();
        if let Some(mut task) = cdr_task {
            match tokio::time::timeout(CDR_DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!("CDR queue drained"),
                Ok(Err(e)) => warn!(error = %e, "CDR task ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_ms = CDR_DRAIN_TIMEOUT.as_millis() as u64,
                        "CDR sink did not drain in time, aborting"
                    );
                    task.abort();
                }
            }
        }
        Ok(())
    }

    /// Re-run the connect handshake, resetting an exhausted reconnect budget
    pub async fn connect(&self) -> EslResult<()> {
        self.connection.connect().await
    }

    pub fn config(&self) -> &EslConfig {
        &self.config
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn active_calls(&self) -> Vec<CallRecord> {
        self.registry.list()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.snapshots.current_stats()
    }

    pub fn stats_history(&self) -> Arc<StatsHistory> {
        self.snapshots.history()
    }

    /// Background jobs still waiting for their `BACKGROUND_JOB` result
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub async fn poll_snapshot(&self) -> EslResult<Arc<ActiveCallsSnapshot>> {
        self.snapshots.poll_once().await
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.hub.subscribe_calls()
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<Arc<EslEvent>> {
        self.hub.subscribe_raw()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<Arc<ActiveCallsSnapshot>> {
        self.hub.subscribe_snapshots()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.connection.subscribe_signals()
    }
}

async fn sweep_jobs(jobs: Arc<JobTable>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(JOB_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let purged = jobs.purge_expired(std::time::Instant::now());
                if purged > 0 {
                    debug!(purged, "Swept expired background jobs");
                }
            }
        }
    }
}
