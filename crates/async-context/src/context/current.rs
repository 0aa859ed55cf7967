use std::cell::RefCell;

use super::{super::task::Task, Context};

/// What is running on this thread right now: the current context and, when
/// inside a task run, the current task.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
	pub(crate) context: Context,
	pub(crate) task: Option<Task>,
}

impl Frame {
	pub(crate) const fn new(context: Context, task: Option<Task>) -> Self {
		Self { context, task }
	}
}

thread_local! {
	// `None` means the root context with no task
	static CURRENT: RefCell<Option<Frame>> = const { RefCell::new(None) };
}

/// Restores the previous frame when dropped, unwinding included.
#[must_use = "the previous frame is restored as soon as the guard is dropped"]
pub(crate) struct FrameGuard {
	prev: Option<Frame>,
}

impl Drop for FrameGuard {
	fn drop(&mut self) {
		replace(self.prev.take());
	}
}

pub(crate) fn enter(frame: Frame) -> FrameGuard {
	FrameGuard {
		prev: replace(Some(frame)),
	}
}

/// Swaps the current frame, returning the previous one. Callers are responsible for restoring it.
pub(crate) fn replace(frame: Option<Frame>) -> Option<Frame> {
	// The slot is gone while the thread is being torn down, nothing to restore then
	CURRENT
		.try_with(|slot| slot.replace(frame))
		.ok()
		.flatten()
}

pub(crate) fn frame() -> Option<Frame> {
	CURRENT
		.try_with(|slot| slot.try_borrow().ok().and_then(|frame| frame.clone()))
		.ok()
		.flatten()
}

pub(crate) fn context() -> Option<Context> {
	CURRENT
		.try_with(|slot| {
			slot.try_borrow()
				.ok()
				.and_then(|frame| frame.as_ref().map(|frame| frame.context.clone()))
		})
		.ok()
		.flatten()
}

pub(crate) fn task() -> Option<Task> {
	CURRENT
		.try_with(|slot| {
			slot.try_borrow()
				.ok()
				.and_then(|frame| frame.as_ref().and_then(|frame| frame.task.clone()))
		})
		.ok()
		.flatten()
}
