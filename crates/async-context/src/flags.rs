//! Process-wide switches that disable categories of native primitive interception.
//!
//! Collaborators (usually a feature detection shim) flip these *before* the
//! [`NativeBridge`](crate::NativeBridge) activates. The bridge reads them once,
//! at activation, through [`Flags::load`].
//!
//! | Variable | Disables |
//! |----------|----------|
//! | `SD_ASYNC_CONTEXT_DISABLE_PROMISE` | promise-like (micro) operations |
//! | `SD_ASYNC_CONTEXT_DISABLE_TIMERS` | timers and immediates |
//! | `SD_ASYNC_CONTEXT_DISABLE_UNHANDLED_ERROR` | the last-resort error observer |
//! | `SD_ASYNC_CONTEXT_DISABLE_CRYPTO` | crypto requests |
//! | `SD_ASYNC_CONTEXT_DISABLE_FS` | filesystem requests |
//! | `SD_ASYNC_CONTEXT_DISABLE_NATIVE_ASYNC_HOOKS` | the whole native bridge |

use std::{
	fmt,
	sync::atomic::{AtomicBool, Ordering},
};

use tracing::trace;

use super::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Patch {
	Promise,
	Timers,
	UnhandledError,
	Crypto,
	Fs,
	NativeAsyncHooks,
}

impl Patch {
	pub const ALL: [Self; 6] = [
		Self::Promise,
		Self::Timers,
		Self::UnhandledError,
		Self::Crypto,
		Self::Fs,
		Self::NativeAsyncHooks,
	];

	const fn index(self) -> usize {
		match self {
			Self::Promise => 0,
			Self::Timers => 1,
			Self::UnhandledError => 2,
			Self::Crypto => 3,
			Self::Fs => 4,
			Self::NativeAsyncHooks => 5,
		}
	}

	#[must_use]
	pub const fn env_var(self) -> &'static str {
		match self {
			Self::Promise => "SD_ASYNC_CONTEXT_DISABLE_PROMISE",
			Self::Timers => "SD_ASYNC_CONTEXT_DISABLE_TIMERS",
			Self::UnhandledError => "SD_ASYNC_CONTEXT_DISABLE_UNHANDLED_ERROR",
			Self::Crypto => "SD_ASYNC_CONTEXT_DISABLE_CRYPTO",
			Self::Fs => "SD_ASYNC_CONTEXT_DISABLE_FS",
			Self::NativeAsyncHooks => "SD_ASYNC_CONTEXT_DISABLE_NATIVE_ASYNC_HOOKS",
		}
	}
}

impl fmt::Display for Patch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Promise => "promise",
			Self::Timers => "timers",
			Self::UnhandledError => "unhandled_error",
			Self::Crypto => "crypto",
			Self::Fs => "fs",
			Self::NativeAsyncHooks => "native_async_hooks",
		};

		write!(f, "{name}")
	}
}

static DISABLED: [AtomicBool; 6] = [
	AtomicBool::new(false),
	AtomicBool::new(false),
	AtomicBool::new(false),
	AtomicBool::new(false),
	AtomicBool::new(false),
	AtomicBool::new(false),
];

static NATIVE_HOOKS_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn disable(patch: Patch) {
	trace!(%patch, "Disabling patch");
	DISABLED[patch.index()].store(true, Ordering::Release);
}

pub fn enable(patch: Patch) {
	trace!(%patch, "Enabling patch");
	DISABLED[patch.index()].store(false, Ordering::Release);
}

#[must_use]
pub fn is_disabled(patch: Patch) -> bool {
	DISABLED[patch.index()].load(Ordering::Acquire)
}

/// Whether a [`NativeBridge`](crate::NativeBridge) is currently active in this process.
///
/// Stays unset when the host lacks native async notifications, so a fallback
/// layer can decide to intercept the scheduling functions directly instead.
#[must_use]
pub fn native_hooks_active() -> bool {
	NATIVE_HOOKS_ACTIVE.load(Ordering::Acquire)
}

pub(crate) fn set_native_hooks_active(active: bool) {
	NATIVE_HOOKS_ACTIVE.store(active, Ordering::Release);
}

/// A snapshot of the disable flags, taken once when the bridge activates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Flags {
	pub promise: bool,
	pub timers: bool,
	pub unhandled_error: bool,
	pub crypto: bool,
	pub fs: bool,
	pub native_async_hooks: bool,
}

impl Flags {
	#[must_use]
	pub fn load() -> Self {
		Self {
			promise: is_disabled(Patch::Promise),
			timers: is_disabled(Patch::Timers),
			unhandled_error: is_disabled(Patch::UnhandledError),
			crypto: is_disabled(Patch::Crypto),
			fs: is_disabled(Patch::Fs),
			native_async_hooks: is_disabled(Patch::NativeAsyncHooks),
		}
	}

	#[must_use]
	pub const fn is_disabled(&self, patch: Patch) -> bool {
		match patch {
			Patch::Promise => self.promise,
			Patch::Timers => self.timers,
			Patch::UnhandledError => self.unhandled_error,
			Patch::Crypto => self.crypto,
			Patch::Fs => self.fs,
			Patch::NativeAsyncHooks => self.native_async_hooks,
		}
	}

	#[must_use]
	pub fn with_disabled(mut self, patch: Patch) -> Self {
		match patch {
			Patch::Promise => self.promise = true,
			Patch::Timers => self.timers = true,
			Patch::UnhandledError => self.unhandled_error = true,
			Patch::Crypto => self.crypto = true,
			Patch::Fs => self.fs = true,
			Patch::NativeAsyncHooks => self.native_async_hooks = true,
		}

		self
	}
}

/// Apply `SD_ASYNC_CONTEXT_DISABLE_*` environment overrides to the process-wide flags.
///
/// Only variables present in the environment are applied. A variable holding
/// something that isn't a boolean fails without touching the remaining flags.
pub fn apply_env_overrides() -> Result<(), Error> {
	let mut overrides = Vec::with_capacity(Patch::ALL.len());

	for patch in Patch::ALL {
		if let Ok(value) = std::env::var(patch.env_var()) {
			overrides.push((patch, parse_bool(patch.env_var(), &value)?));
		}
	}

	for (patch, disabled) in overrides {
		if disabled {
			disable(patch);
		} else {
			enable(patch);
		}
	}

	Ok(())
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, Error> {
	match value.trim().to_lowercase().as_str() {
		"true" | "1" | "yes" | "on" => Ok(true),
		"false" | "0" | "no" | "off" => Ok(false),
		_ => Err(Error::InvalidConfig {
			var,
			value: value.to_string(),
		}),
	}
}
