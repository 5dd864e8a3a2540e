//! Seam between the session and whatever draws on the display.
//!
//! The window system calls back into the session through
//! [`WindowManagerCallbacks`]; the session drives the window system through
//! [`WindowSystemBridge`]. Only a headless implementation ships here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::app_manager::{StartError, StopError, StopOutcome};
use crate::config::DisplaySettings;

#[derive(Debug, Error)]
pub enum BridgeError {
	#[error("window system unavailable: {0}")]
	Unavailable(String),

	#[error("window system rejected display settings: {0}")]
	Settings(String),
}

/// Requests the window system makes of the session.
#[async_trait]
pub trait WindowManagerCallbacks: Send + Sync {
	/// Starts the allow-listed application `name` and returns its pid.
	async fn start_request(&self, name: &str) -> Result<u32, StartError>;

	/// Asks the application owning `pid` to stop on behalf of `requester`.
	async fn stop_request(&self, pid: u32, requester: u32) -> Result<StopOutcome, StopError>;

	fn process_added(&self, pid: u32);

	fn process_removed(&self, pid: u32);

	fn window_added(&self, pid: u32, window: u32);

	fn window_removed(&self, pid: u32, window: u32);

	fn switch_focus(&self, pid: u32);
}

pub trait WindowSystemBridge: Send {
	fn init(&mut self, callbacks: Arc<dyn WindowManagerCallbacks>, settings: &DisplaySettings) -> Result<(), BridgeError>;

	fn shutdown(&mut self);
}

/// Bridge for running without a window system.
#[derive(Default)]
pub struct HeadlessBridge {
	callbacks: Option<Arc<dyn WindowManagerCallbacks>>,
}

impl HeadlessBridge {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_initialised(&self) -> bool {
		self.callbacks.is_some()
	}
}

impl WindowSystemBridge for HeadlessBridge {
	fn init(&mut self, callbacks: Arc<dyn WindowManagerCallbacks>, settings: &DisplaySettings) -> Result<(), BridgeError> {
		info!(
			target = "maestro.orchestrator",
			background = ?settings.background_mode,
			cursor = settings.cursor_enabled,
			statusbar_height = settings.statusbar_height,
			"headless window system"
		);
		self.callbacks = Some(callbacks);
		Ok(())
	}

	fn shutdown(&mut self) {
		if self.callbacks.take().is_some() {
			debug!(target = "maestro.orchestrator", "headless window system shut down");
		}
	}
}
