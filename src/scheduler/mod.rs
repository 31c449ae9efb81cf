//! Prayer event scheduling
//!
//! This module turns resolved prayer times into delivered events.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        EventDispatcher                        │
//! │  ┌─────────────────┐   ┌──────────────┐   ┌─────────────────┐ │
//! │  │ ScheduleComputer│◄──│ TimesLookup  │   │ DeliveryChannel │ │
//! │  │  + PeriodicPlan │   │ (resolver)   │   │ log / webhook   │ │
//! │  └────────┬────────┘   └──────────────┘   └────────▲────────┘ │
//! │           │ events                                 │          │
//! │           └──► dedup ledger claim ─────────────────┘          │
//! └───────────────────────────────────────────────────────────────┘
//!
//! ┌───────────────────────────────────────────────────────────────┐
//! │ MaintenanceTrigger: purge │ alerts │ prefetch │ ledger prune  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`schedule`] - pre-alert / start / delayed action computation
//! - [`periodic`] - wall-clock remembrance slots
//! - [`dispatcher`] - the dispatch loop and delivery contract
//! - [`trigger`] - periodic maintenance loops
//! - [`error`] - scheduler error types
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mawaqit::scheduler::{EventDispatcher, LogDelivery, ScheduleComputer};
//!
//! let dispatcher = EventDispatcher::new(
//!     ScheduleComputer::default(),
//!     resolver,
//!     groups,
//!     health,
//!     Arc::new(LogDelivery),
//! );
//! dispatcher.run(shutdown_rx).await;
//! ```

pub mod dispatcher;
pub mod error;
pub mod periodic;
pub mod schedule;
pub mod trigger;

pub use dispatcher::{
    DeliveryChannel, DeliveryError, DispatchError, EventDispatcher, GraceWindows, LogDelivery,
    PassReport, WebhookDelivery,
};
pub use error::{SchedulerError, SchedulerResult};
pub use periodic::PeriodicPlan;
pub use schedule::ScheduleComputer;
pub use trigger::{MaintenanceTask, MaintenanceTrigger, TriggerConfig, TriggerEvent};
