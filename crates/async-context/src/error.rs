use std::any::Any;

use thiserror::Error;

use super::task::{TaskId, TaskState};

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("task <id='{task_id}'> can't transition to {to} from {from}")]
	InvalidTransition {
		task_id: TaskId,
		from: TaskState,
		to: TaskState,
	},
	#[error("task <id='{task_id}'> belongs to context '{owner}' and can't be handled by '{target}'")]
	ForeignTask {
		task_id: TaskId,
		owner: String,
		target: String,
	},
	#[error("unhandled error on task work: {0}")]
	Unhandled(#[source] WorkError),
	#[error("no tokio runtime available to drive the timer")]
	RuntimeUnavailable,
	#[error("invalid value for {var}: expected bool (true/false/1/0/yes/no/on/off), got {value:?}")]
	InvalidConfig { var: &'static str, value: String },
}

/// An error raised by a task's work, either returned or thrown as a panic.
#[derive(Debug, Error)]
pub enum WorkError {
	#[error(transparent)]
	Failed(Box<dyn std::error::Error + Send + Sync>),
	#[error("task work panicked: {0}")]
	Panicked(String),
}

impl WorkError {
	pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
		Self::Failed(source.into())
	}

	/// Converts a panic payload, as returned by [`std::panic::catch_unwind`], into a [`WorkError`].
	#[must_use]
	pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
		Self::Panicked(panic_message(payload.as_ref()))
	}

	#[must_use]
	pub const fn is_panic(&self) -> bool {
		matches!(self, Self::Panicked(_))
	}
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	payload
		.downcast_ref::<&str>()
		.map(ToString::to_string)
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "<non-string panic payload>".to_string())
}

/// Error returned by a [`NativeHost`](crate::NativeHost) that lacks native async notifications.
#[derive(Debug, Error)]
#[error("native async hooks unavailable: {reason}")]
pub struct HostError {
	pub reason: String,
}

impl HostError {
	pub fn new(reason: impl Into<String>) -> Self {
		Self {
			reason: reason.into(),
		}
	}
}
