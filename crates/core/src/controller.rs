//! The owner's message-driven state machine.
//!
//! Every inbound message on the owner channel is dispatched by the role of
//! its sender (status bar, on-screen keyboard, or ordinary application).
//! Decisions are taken from registry state read under the registry lock,
//! never from message arrival order, and follow-up messages are collected in
//! an outbox that is only posted once every lock has been released.
//!
//! The one invariant this module owns: at most one record is `Visible`.
//! Every transition to `Visible` goes through [`SessionController::grant_foreground`]
//! or the `Notification(Visible)` handler, both of which hide all other
//! visible records in the same registry transaction.

use std::path::Path;

use maestro_protocol::{AppState, Channel, Disposition, Lifecycle, Message, MessageType, Visibility};
use maestro_runtime::{AppRecord, PostError, SessionHandle};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Which part an application plays in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	StatusBar,
	Keyboard,
	Home,
	App,
}

/// Executable names of the applications with a special role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roles {
	statusbar: String,
	home: String,
	keyboard: String,
}

impl Roles {
	pub fn new(statusbar: impl AsRef<Path>, home: impl AsRef<Path>, keyboard: impl AsRef<Path>) -> Self {
		Self {
			statusbar: file_name(statusbar.as_ref()),
			home: file_name(home.as_ref()),
			keyboard: file_name(keyboard.as_ref()),
		}
	}

	pub fn from_config(config: &Config) -> Self {
		Self::new(&config.statusbar, &config.home, &config.osk)
	}

	pub fn role_of(&self, record: &AppRecord) -> Role {
		let name = record.executable_name();
		if name.is_empty() {
			Role::App
		} else if name == self.statusbar {
			Role::StatusBar
		} else if name == self.keyboard {
			Role::Keyboard
		} else if name == self.home {
			Role::Home
		} else {
			Role::App
		}
	}

	fn is_overlay(&self, record: &AppRecord) -> bool {
		matches!(self.role_of(record), Role::StatusBar | Role::Keyboard)
	}
}

fn file_name(path: &Path) -> String {
	path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Focus bookkeeping, by bus identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Focus {
	/// Application that last reported itself visible.
	pub current: Option<u32>,
	pub home: Option<u32>,
	/// Application the keyboard is typing into.
	pub osk_target: Option<u32>,
}

type Outbox = Vec<(Channel, Message)>;

pub struct SessionController {
	session: SessionHandle,
	roles: Roles,
	focus: Mutex<Focus>,
}

impl SessionController {
	pub fn new(session: SessionHandle, roles: Roles) -> Self {
		Self {
			session,
			roles,
			focus: Mutex::new(Focus::default()),
		}
	}

	pub fn focus(&self) -> Focus {
		*self.focus.lock()
	}

	pub fn session(&self) -> &SessionHandle {
		&self.session
	}

	pub fn roles(&self) -> &Roles {
		&self.roles
	}

	/// Handles one inbound message; never blocks on a receiver.
	pub fn handle(&self, message: Message) -> Disposition {
		let mut outbox = Outbox::new();
		let disposition = {
			let mut focus = self.focus.lock();
			self.dispatch(&mut focus, message, &mut outbox)
		};
		self.flush(outbox);
		disposition
	}

	fn dispatch(&self, focus: &mut Focus, message: Message, out: &mut Outbox) -> Disposition {
		let Some((_, sender)) = self.session.registry().find(|r| r.identity == message.sender) else {
			debug!(target = "maestro.controller", %message, "dropping message from unregistered sender");
			return Disposition::Dropped;
		};

		let role = self.roles.role_of(&sender);
		let disposition = match role {
			Role::StatusBar => self.handle_statusbar(focus, &sender, message, out),
			Role::Keyboard => self.handle_keyboard(focus, &sender, message, out),
			Role::Home | Role::App => self.handle_app(focus, &sender, message, out),
		};

		if disposition == Disposition::Dropped {
			warn!(target = "maestro.controller", %message, ?role, title = %sender.title, "message not supported for sender");
		}
		disposition
	}

	fn handle_statusbar(&self, focus: &mut Focus, sender: &AppRecord, message: Message, out: &mut Outbox) -> Disposition {
		match (message.kind, message.state) {
			(MessageType::ModeRequest, AppState::Visible) => {
				out.push(self.command(sender.identity, MessageType::SwitchMode, AppState::Visible));
				Disposition::Accepted
			}
			// The status bar addresses its target by bus identity.
			(MessageType::SwitchMode, AppState::Visible) => self.grant_foreground(focus, message.target, out),
			(MessageType::SwitchMode, state @ (AppState::Hidden | AppState::Quit)) => {
				if self.session.registry().find_by_identity(message.target).is_none() {
					return Disposition::Dropped;
				}
				out.push(self.command(message.target, MessageType::SwitchMode, state));
				Disposition::Accepted
			}
			(MessageType::Notification, AppState::Terminating) => {
				self.set_lifecycle(sender, Lifecycle::Quit);
				info!(target = "maestro.controller", "status bar is terminating");
				Disposition::Accepted
			}
			(MessageType::Notification, AppState::Visible | AppState::Hidden | AppState::Initialising | AppState::Ready) => Disposition::Accepted,
			_ => Disposition::Dropped,
		}
	}

	fn handle_keyboard(&self, focus: &mut Focus, sender: &AppRecord, message: Message, out: &mut Outbox) -> Disposition {
		match (message.kind, message.state) {
			(MessageType::ModeRequest, AppState::Visible) => Disposition::Accepted,
			(MessageType::ModeRequest, AppState::Hidden) => {
				out.push(self.command(sender.identity, MessageType::SwitchMode, AppState::Hidden));
				focus.osk_target = None;
				Disposition::Accepted
			}
			(MessageType::Notification, AppState::Terminating) => {
				self.set_lifecycle(sender, Lifecycle::Quit);
				focus.osk_target = None;
				debug!(target = "maestro.controller", "keyboard is terminating");
				Disposition::Accepted
			}
			(MessageType::Notification, AppState::Visible | AppState::Hidden | AppState::Initialising | AppState::Ready) => Disposition::Accepted,
			(MessageType::OSKEvent, _) => {
				if let Some(target) = focus.osk_target {
					out.push(self.command(target, MessageType::OSKEvent, AppState::Ready));
				}
				Disposition::Accepted
			}
			_ => Disposition::Dropped,
		}
	}

	fn handle_app(&self, focus: &mut Focus, sender: &AppRecord, message: Message, out: &mut Outbox) -> Disposition {
		if self.resolve_home(focus).is_none() {
			debug!(target = "maestro.controller", identity = sender.identity, title = %sender.title, "electing first application as home");
			focus.home = Some(sender.identity);
		}

		match (message.kind, message.state) {
			(MessageType::ModeRequest, AppState::Visible) => self.grant_foreground(focus, sender.identity, out),
			(MessageType::SwitchMode, AppState::Visible) if focus.home == Some(sender.identity) => self.grant_foreground(focus, message.target, out),
			(MessageType::Notification, AppState::Initialising | AppState::Ready) => {
				debug!(target = "maestro.controller", identity = sender.identity, state = %message.state, "lifecycle notification");
				Disposition::Accepted
			}
			(MessageType::Notification, AppState::Visible) => self.became_visible(focus, sender, out),
			(MessageType::Notification, AppState::Hidden) => {
				self.hide_keyboard_for(focus, sender.identity, out);
				if focus.current == Some(sender.identity) {
					focus.current = None;
				}
				self.set_visibility(sender, Visibility::Hidden);
				Disposition::Accepted
			}
			(MessageType::Notification, AppState::Terminating) => {
				self.set_lifecycle(sender, Lifecycle::Quit);
				self.retire(focus, sender.identity, out);
				Disposition::Accepted
			}
			(MessageType::OSKEvent, state) if focus.current == Some(sender.identity) => match state {
				AppState::Visible => match self.keyboard_identity() {
					Some(keyboard) => {
						focus.osk_target = Some(sender.identity);
						out.push(self.command(keyboard, MessageType::SwitchMode, AppState::Visible));
						Disposition::Accepted
					}
					None => Disposition::Dropped,
				},
				AppState::Hidden => {
					self.hide_keyboard_for(focus, sender.identity, out);
					Disposition::Accepted
				}
				_ => Disposition::Dropped,
			},
			_ => Disposition::Dropped,
		}
	}

	/// Makes `target` the only visible application and tells everyone involved.
	///
	/// If `target` already holds the foreground nothing changes in the
	/// registry, but it is told to show itself again.
	pub fn grant_foreground(&self, focus: &mut Focus, target: u32, out: &mut Outbox) -> Disposition {
		let roles = &self.roles;
		let granted = self
			.session
			.registry()
			.transaction(|tx| {
				let (handle, record) = tx.find(|r| r.identity == target)?;
				if record.lifecycle.is_ending() || roles.is_overlay(&record) {
					return None;
				}
				let displaced: Vec<_> = tx.records().into_iter().filter(|(h, r)| *h != handle && r.is_visible()).collect();
				for (other, _) in &displaced {
					let _ = tx.update(*other, |r| r.visibility = Visibility::Hidden);
				}
				tx.update(handle, |r| r.visibility = Visibility::Visible).ok()?;
				Some((record.is_visible(), displaced.into_iter().map(|(_, r)| r.identity).collect::<Vec<_>>()))
			})
			.ok()
			.flatten();

		let Some((already_visible, displaced)) = granted else {
			debug!(target = "maestro.controller", identity = target, "foreground request for unknown or ending application");
			return Disposition::Dropped;
		};

		for identity in displaced {
			out.push(self.command(identity, MessageType::SwitchMode, AppState::Hidden));
			self.hide_keyboard_for(focus, identity, out);
		}
		if already_visible {
			debug!(target = "maestro.controller", identity = target, "already in foreground, asking it to show again");
		}
		out.push(self.command(target, MessageType::SwitchMode, AppState::Visible));
		Disposition::Accepted
	}

	fn became_visible(&self, focus: &mut Focus, sender: &AppRecord, out: &mut Outbox) -> Disposition {
		let identity = sender.identity;
		let displaced = self
			.session
			.registry()
			.transaction(|tx| {
				let (handle, _) = tx.find(|r| r.identity == identity)?;
				let displaced: Vec<_> = tx.records().into_iter().filter(|(h, r)| *h != handle && r.is_visible()).collect();
				for (other, _) in &displaced {
					let _ = tx.update(*other, |r| r.visibility = Visibility::Hidden);
				}
				tx.update(handle, |r| r.visibility = Visibility::Visible).ok()?;
				Some(displaced.into_iter().map(|(_, r)| r.identity).collect::<Vec<_>>())
			})
			.ok()
			.flatten();

		let Some(displaced) = displaced else {
			return Disposition::Dropped;
		};
		for other in displaced {
			warn!(target = "maestro.controller", other, identity, "hiding application that was still visible");
			out.push(self.command(other, MessageType::SwitchMode, AppState::Hidden));
		}

		focus.current = Some(identity);
		if let Some(statusbar) = self.statusbar_identity() {
			let (channel, message) = self.command(statusbar, MessageType::Notification, AppState::Visible);
			out.push((channel, message.with_target(identity)));
		}
		debug!(target = "maestro.controller", identity, title = %sender.title, "application is visible");
		Disposition::Accepted
	}

	/// Forgets an application that is leaving and puts home back in front.
	fn retire(&self, focus: &mut Focus, identity: u32, out: &mut Outbox) {
		self.hide_keyboard_for(focus, identity, out);
		if focus.current == Some(identity) {
			focus.current = None;
		}

		if focus.home == Some(identity) {
			focus.home = None;
			if let Some(home) = self.resolve_home(focus) {
				info!(target = "maestro.controller", home, "elected new home");
			}
		} else if let Some(home) = self.resolve_home(focus) {
			self.grant_foreground(focus, home, out);
		}
	}

	fn hide_keyboard_for(&self, focus: &mut Focus, identity: u32, out: &mut Outbox) {
		if focus.osk_target != Some(identity) {
			return;
		}
		focus.osk_target = None;
		if let Some(keyboard) = self.keyboard_identity() {
			out.push(self.command(keyboard, MessageType::SwitchMode, AppState::Hidden));
		}
	}

	/// Current home if still registered, else the configured home application.
	fn resolve_home(&self, focus: &mut Focus) -> Option<u32> {
		let registry = self.session.registry();
		if let Some(home) = focus.home {
			if registry.find(|r| r.identity == home && !r.lifecycle.is_ending()).is_some() {
				return Some(home);
			}
		}
		focus.home = registry
			.find(|r| self.roles.role_of(r) == Role::Home && !r.lifecycle.is_ending())
			.map(|(_, r)| r.identity);
		focus.home
	}

	fn statusbar_identity(&self) -> Option<u32> {
		self.session.registry().find(|r| self.roles.role_of(r) == Role::StatusBar).map(|(_, r)| r.identity)
	}

	fn keyboard_identity(&self) -> Option<u32> {
		self.session.registry().find(|r| self.roles.role_of(r) == Role::Keyboard).map(|(_, r)| r.identity)
	}

	fn set_lifecycle(&self, record: &AppRecord, lifecycle: Lifecycle) {
		let updated = self.session.registry().transaction(|tx| {
			let (handle, _) = tx.find(|r| r.identity == record.identity)?;
			tx.update(handle, |r| {
				r.lifecycle = lifecycle;
				if lifecycle.is_ending() {
					r.visibility = Visibility::Hidden;
				}
			})
			.ok()
		});
		if !matches!(updated, Ok(Some(()))) {
			debug!(target = "maestro.controller", identity = record.identity, "record vanished before lifecycle update");
		}
	}

	fn set_visibility(&self, record: &AppRecord, visibility: Visibility) {
		let _ = self.session.registry().transaction(|tx| {
			let (handle, _) = tx.find(|r| r.identity == record.identity)?;
			tx.update(handle, |r| r.visibility = visibility).ok()
		});
	}

	/// Removes records whose process is gone and repairs focus after them.
	pub fn reap_dead(&self, is_running: impl Fn(u32) -> bool) -> Vec<AppRecord> {
		let removed = self.session.registry().remove_where(|r| !is_running(r.pid));
		if removed.is_empty() {
			return removed;
		}

		let mut outbox = Outbox::new();
		{
			let mut focus = self.focus.lock();
			for record in &removed {
				warn!(target = "maestro.controller", pid = record.pid, title = %record.title, "reaped record of dead process");
				self.retire(&mut focus, record.identity, &mut outbox);
				if self.session.bus().release(Channel::App(record.identity)) {
					debug!(target = "maestro.controller", identity = record.identity, "released channel of dead process");
				}
			}
		}
		self.flush(outbox);
		removed
	}

	fn command(&self, to: u32, kind: MessageType, state: AppState) -> (Channel, Message) {
		(Channel::App(to), Message::new(self.session.identity(), kind, state))
	}

	fn flush(&self, outbox: Outbox) {
		for (channel, message) in outbox {
			match self.session.bus().post(channel, message) {
				Ok(()) => debug!(target = "maestro.controller", %channel, %message, "sent"),
				Err(err @ PostError::BusFull { .. }) => warn!(target = "maestro.controller", %channel, %message, error = %err, "dropping best-effort message"),
				Err(PostError::Detached) => debug!(target = "maestro.controller", %channel, %message, "bus detached, message not sent"),
			}
		}
	}
}
