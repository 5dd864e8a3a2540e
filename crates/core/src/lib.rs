//! Session coordinator for several application processes sharing one display.
//!
//! The owner process creates a shared-memory world, runs the
//! [`SessionController`] over the owner-inbound bus channel and sequences the
//! mandatory applications through the [`Orchestrator`]. Every application
//! process attaches as a joiner through [`AppSession`].
//!
//! ```text
//! Orchestrator ─▶ WorldConnector ─▶ Arena ─▶ Bus / Registry
//!                                             ▲
//! AppSession (one per app) ───────────────────┘
//! ```

pub mod app_manager;
pub mod bridge;
pub mod client;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod launcher;
pub mod orchestrator;

pub use app_manager::{AppManager, ManagedApp, StartError, StopError, StopOutcome};
pub use bridge::{BridgeError, HeadlessBridge, WindowManagerCallbacks, WindowSystemBridge};
pub use client::AppSession;
pub use config::{Config, ConfigError, DisplaySettings, Paths};
pub use control::{AppStatus, StatusReport, StopResult, is_running, status, stop};
pub use controller::{Focus, Role, Roles, SessionController};
pub use error::{Error, Result};
pub use launcher::{ProcessLauncher, SpawnError, SystemLauncher, WORLD_INDEX_ENV};
pub use maestro_protocol::{AppState, Channel, Disposition, Lifecycle, Message, MessageType, PROTOCOL_VERSION, Visibility};
pub use maestro_runtime::{
	AppRecord, Arena, ArenaConfig, ConnectError, Connection, LocalWorld, PollTimeout, RecordHandle, SessionHandle, WorldConnector, poll_until,
};
pub use orchestrator::{Orchestrator, OrchestratorError, shutdown_signal};
