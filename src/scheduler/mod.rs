//! Scheduled actions: definitions, dispatch and the leader-gated service.
//!
//! # Components
//!
//! - [`ScheduledAction`]: an action built from its store subtree, with its own ticker
//! - [`ActionDispatcher`]: maps action type tags to [`ActionHandler`]s
//! - [`Reconciler`]: long-polls the actions keyspace and starts/stops actions
//! - [`Scheduler`]: active/inactive state machine driven by leader election
//! - [`registrar`]: helpers for the producer side of the keyspace
//!
//! # Flow
//!
//! 1. A registrar writes `actions/<id>/{type,interval,deploymentID,...}`
//! 2. The leader's reconciler sees the index move, builds and starts the action
//! 3. Each tick dispatches to the handler registered for the action type
//! 4. Setting `actions/<id>/.unregisterFlag=true` stops the action and deletes
//!    the subtree

pub mod action;
pub mod dispatch;
pub mod interval;
pub mod reconciler;
pub mod registrar;
pub mod service;

pub use action::ScheduledAction;
pub use dispatch::{ActionContext, ActionDispatcher, ActionHandler, LogActionHandler, TaskRecordHandler};
pub use interval::parse_interval;
pub use reconciler::{ActionRegistry, CycleReport, Reconciler};
pub use registrar::{register_action, unregister_action, ActionDefinition};
pub use service::Scheduler;
