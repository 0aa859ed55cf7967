use std::{fmt, sync::Arc};

use tracing::{debug, warn};

use super::super::{
	error::{HostError, WorkError},
	flags::{self, Patch},
	task::TaskKind,
};

/// Identifier the host runtime assigns to each native asynchronous operation.
pub type AsyncId = u64;

/// Lifecycle notifications a host runtime delivers for its native asynchronous operations.
///
/// For a given id, `init` always comes first and `destroy` last, with any number of
/// `before`/`after` pairs in between.
pub trait AsyncHooks: Send + Sync {
	fn init(&self, id: AsyncId, kind: &str, trigger_id: AsyncId);

	fn before(&self, id: AsyncId);

	fn after(&self, id: AsyncId);

	fn destroy(&self, id: AsyncId);

	/// An error escaped a callback of a native operation, before its `after`.
	///
	/// Given back when nobody claimed it, the host must then report it the way it reports
	/// uncaught errors.
	fn uncaught(&self, error: WorkError) -> Result<(), WorkError> {
		Err(error)
	}
}

/// A host runtime able to report its native asynchronous operations.
pub trait NativeHost {
	/// Checks the host actually provides native async notifications.
	fn async_hooks_available(&self) -> Result<(), HostError> {
		Ok(())
	}

	/// Starts delivering notifications to `hooks`, until the host drops them.
	fn register_hooks(&self, hooks: Arc<dyn AsyncHooks>) -> Result<(), HostError>;
}

/// The native operation kinds the host reports, as far as this crate cares about them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NativeKind {
	Promise,
	Timeout,
	Immediate,
	FsRequest,
	/// Low level wrapper around timeouts, which are already observed on their own.
	TimerWrap,
	RandomBytes,
	Pbkdf2,
	Other(String),
}

impl NativeKind {
	#[must_use]
	pub fn parse(kind: &str) -> Self {
		match kind {
			"PROMISE" => Self::Promise,
			"Timeout" => Self::Timeout,
			"Immediate" => Self::Immediate,
			"FSREQWRAP" | "FSREQCALLBACK" => Self::FsRequest,
			"TIMERWRAP" => Self::TimerWrap,
			"RANDOMBYTESREQUEST" => Self::RandomBytes,
			"PBKDF2REQUEST" => Self::Pbkdf2,
			other => Self::Other(other.to_string()),
		}
	}

	/// The kind of task tracking this operation, `None` for operations that are never tracked.
	#[must_use]
	pub const fn task_kind(&self) -> Option<TaskKind> {
		match self {
			Self::Promise => Some(TaskKind::Micro),
			Self::Timeout | Self::Immediate | Self::FsRequest | Self::RandomBytes | Self::Pbkdf2 => {
				Some(TaskKind::Macro)
			}
			Self::TimerWrap | Self::Other(_) => None,
		}
	}

	/// The category that, once disabled, stops this kind from being tracked.
	#[must_use]
	pub const fn patch(&self) -> Option<Patch> {
		match self {
			Self::Promise => Some(Patch::Promise),
			Self::Timeout | Self::Immediate => Some(Patch::Timers),
			Self::FsRequest => Some(Patch::Fs),
			Self::RandomBytes | Self::Pbkdf2 => Some(Patch::Crypto),
			Self::TimerWrap | Self::Other(_) => None,
		}
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		match self {
			Self::Promise => "PROMISE",
			Self::Timeout => "Timeout",
			Self::Immediate => "Immediate",
			Self::FsRequest => "FSREQWRAP",
			Self::TimerWrap => "TIMERWRAP",
			Self::RandomBytes => "RANDOMBYTESREQUEST",
			Self::Pbkdf2 => "PBKDF2REQUEST",
			Self::Other(kind) => kind,
		}
	}
}

impl fmt::Display for NativeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Checks whether `host` provides native async notifications.
///
/// A missing capability is never an error: it disables [`Patch::NativeAsyncHooks`] so
/// a fallback layer can take over, and returns `false`.
pub fn probe_native_support(host: &impl NativeHost) -> bool {
	match host.async_hooks_available() {
		Ok(()) => {
			debug!("Native async hooks available");
			true
		}
		Err(e) => {
			warn!(%e, "Native async hooks unavailable, disabling them");
			flags::disable(Patch::NativeAsyncHooks);
			false
		}
	}
}
