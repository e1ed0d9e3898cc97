//! Event-socket call-control client
//!
//! `rvoip-esl-core` keeps a long-lived connection to a telephony switch's
//! event socket and turns its event stream into a queryable model of the
//! calls that are up right now. On top of that model it offers a command
//! surface (originate, hangup, transfer, hold, record, raw api) and broadcast
//! channels for real-time consumers.
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`protocol`] | Frame codec and event parsing |
//! | [`connection`] | Connect, authenticate, subscribe, reconnect with backoff |
//! | [`dispatcher`] | Routes events to registry transitions, republishes them |
//! | [`registry`] | Live call id to [`CallRecord`] map |
//! | [`gateway`] | `api` / `bgapi` commands and job correlation |
//! | [`snapshot`] | Periodic full call list, drift report, statistics history |
//! | [`service`] | Wires everything and owns the background tasks |
//!
//! # Quick start
//!
//! ```rust,no_run
//! use rvoip_esl_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> EslResult<()> {
//!     let service = CallControlService::new(EslConfig::from_env()?);
//!     service.start().await?;
//!
//!     let mut calls = service.subscribe_calls();
//!     while let Ok(event) = calls.recv().await {
//!         println!("{}: {:?} ({})", event.call_id, event.kind, event.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod cdr;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod jobs;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod stats;

pub use call::{CallDirection, CallRecord, CallStatus, CallView};
pub use cdr::{CdrAnswer, CdrCreate, CdrFinal, CdrForwarder, CdrSink, LoggingCdrSink};
pub use config::{EslConfig, ReconnectConfig, SnapshotConfig};
pub use connection::{ConnectionManager, ConnectionSignal, ConnectionState, ReconnectPolicy};
pub use dispatcher::{BillingLegPredicate, ChannelMarkerBillingLeg, EventDispatcher};
pub use error::{EslError, EslResult};
pub use events::{CallEvent, CallEventKind, EventHub};
pub use gateway::{CommandGateway, OriginateRequest, SwitchStatus};
pub use jobs::JobTable;
pub use protocol::{EslEvent, EslFrame};
pub use registry::CallRegistry;
pub use service::CallControlService;
pub use snapshot::{ActiveCallsSnapshot, Reconciliation, SnapshotEngine};
pub use stats::{StatsHistory, StatsSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{
        ActiveCallsSnapshot, CallControlService, CallDirection, CallEvent, CallEventKind,
        CallRecord, CallStatus, CommandGateway, ConnectionSignal, EslConfig, EslError, EslResult,
        OriginateRequest, StatsSnapshot,
    };
}
