//! The application side of a session.
//!
//! An application process attaches to a running world, registers its
//! record, listens on its own channel and reports state changes to the
//! owner. Dropping the [`AppSession`] removes the record, which is the
//! process's exit hook.

use std::path::Path;
use std::time::Duration;

use maestro_protocol::{AppState, Channel, Disposition, Lifecycle, Message, MessageType};
use maestro_runtime::process::current_pid;
use maestro_runtime::{Arena, AppRecord, Connection, RecordHandle, SessionHandle, Subscription, WorldConnector};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub struct AppSession {
	session: SessionHandle,
	record: Option<RecordHandle>,
	// Declared last so the record is withdrawn before the world is released.
	connection: Connection,
}

impl AppSession {
	/// Joins a running world, waiting for its arena to be published.
	pub async fn attach(connector: &WorldConnector, limit: u32, interval: Duration) -> Result<Self> {
		let (connection, _) = connector.connect_async(true).await?;
		Self::join(connection, limit, interval).await
	}

	pub async fn join(connection: Connection, limit: u32, interval: Duration) -> Result<Self> {
		let session = Arena::join_with_retry(&connection, limit, interval).await?;
		Ok(Self::from_parts(connection, session))
	}

	pub fn from_parts(connection: Connection, session: SessionHandle) -> Self {
		debug!(target = "maestro.apps", identity = connection.identity(), "application attached");
		Self {
			session,
			record: None,
			connection,
		}
	}

	pub fn identity(&self) -> u32 {
		self.connection.identity()
	}

	pub fn session(&self) -> &SessionHandle {
		&self.session
	}

	/// Registers this process. `pid` defaults to the calling process.
	///
	/// Fails while an earlier registration of this session is still live.
	pub fn register(&mut self, title: &str, path: impl AsRef<Path>, pid: Option<u32>) -> Result<RecordHandle> {
		let path = path.as_ref().to_string_lossy();
		let handle = self.session.registry().register(self.identity(), pid.unwrap_or_else(current_pid), title, &path)?;
		info!(target = "maestro.apps", identity = self.identity(), %handle, title, "registered");
		self.record = Some(handle);
		Ok(handle)
	}

	pub fn record(&self) -> Option<AppRecord> {
		self.record.and_then(|h| self.session.registry().get(h))
	}

	/// Sends a message to the owner.
	pub fn post(&self, kind: MessageType, state: AppState, target: Option<u32>) -> Result<()> {
		let mut message = Message::new(self.identity(), kind, state);
		if let Some(target) = target {
			message = message.with_target(target);
		}
		self.session.bus().post(Channel::Owner, message)?;
		Ok(())
	}

	pub fn notify(&self, state: AppState) -> Result<()> {
		self.post(MessageType::Notification, state, None)
	}

	/// Updates the durable lifecycle field of this process's record.
	pub fn set_lifecycle(&self, lifecycle: Lifecycle) -> Result<()> {
		let handle = self.record.ok_or(Error::NotRegistered)?;
		self.session.registry().mutate(handle, |r| r.lifecycle = lifecycle)?;
		Ok(())
	}

	pub fn subscribe_my_channel(&self, handler: impl FnMut(Message) + Send + 'static) -> Result<Subscription> {
		Ok(self.session.bus().subscribe(Channel::App(self.identity()), handler)?)
	}

	pub fn subscribe_broadcast(&self, handler: impl FnMut(Message) + Send + 'static) -> Result<Subscription> {
		Ok(self.session.bus().subscribe(Channel::Broadcast, handler)?)
	}

	/// Default reaction to a command from the owner.
	///
	/// A quit request on a record that is already leaving changes nothing.
	pub fn handle_command(&self, message: Message) -> Disposition {
		match (message.kind, message.state) {
			(MessageType::SwitchMode, AppState::Quit) => {
				let Some(record) = self.record() else {
					return Disposition::Dropped;
				};
				if record.lifecycle.is_ending() {
					debug!(target = "maestro.apps", identity = self.identity(), "already quitting");
					return Disposition::Dropped;
				}
				if let Err(err) = self.set_lifecycle(Lifecycle::Terminating) {
					warn!(target = "maestro.apps", error = %err, "failed to mark record terminating");
				}
				self.report(AppState::Terminating);
				Disposition::Accepted
			}
			(MessageType::SwitchMode, state @ (AppState::Visible | AppState::Hidden)) => {
				self.report(state);
				Disposition::Accepted
			}
			(MessageType::OSKEvent, AppState::Ready) => {
				debug!(target = "maestro.apps", text = %self.session.osk().read(), "keyboard input ready");
				Disposition::Accepted
			}
			_ => Disposition::Dropped,
		}
	}

	fn report(&self, state: AppState) {
		if let Err(err) = self.notify(state) {
			warn!(target = "maestro.apps", %state, error = %err, "notification not delivered");
		}
	}

	/// Removes this process's record.
	pub fn withdraw(&mut self) -> Option<AppRecord> {
		let handle = self.record.take()?;
		match self.session.registry().remove(handle) {
			Ok(record) => {
				debug!(target = "maestro.apps", %handle, "record withdrawn");
				Some(record)
			}
			Err(err) => {
				debug!(target = "maestro.apps", %handle, error = %err, "record already gone");
				None
			}
		}
	}
}

impl Drop for AppSession {
	fn drop(&mut self) {
		self.withdraw();
	}
}
