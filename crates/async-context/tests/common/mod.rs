#![allow(dead_code)]

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, Mutex},
	thread,
};

use sd_async_context::{AsyncHooks, AsyncId, Handler, HostError, NativeHost, WorkError};

/// A host runtime delivering native async notifications on demand.
#[derive(Default)]
pub struct FakeHost {
	hooks: Mutex<Option<Arc<dyn AsyncHooks>>>,
	unavailable: bool,
}

impl FakeHost {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn unavailable() -> Self {
		Self {
			unavailable: true,
			..Default::default()
		}
	}

	pub fn is_registered(&self) -> bool {
		self.hooks.lock().unwrap().is_some()
	}

	fn hooks(&self) -> Option<Arc<dyn AsyncHooks>> {
		self.hooks.lock().unwrap().clone()
	}

	pub fn init(&self, id: AsyncId, kind: &str) {
		if let Some(hooks) = self.hooks() {
			hooks.init(id, kind, 0);
		}
	}

	pub fn before(&self, id: AsyncId) {
		if let Some(hooks) = self.hooks() {
			hooks.before(id);
		}
	}

	pub fn after(&self, id: AsyncId) {
		if let Some(hooks) = self.hooks() {
			hooks.after(id);
		}
	}

	pub fn destroy(&self, id: AsyncId) {
		if let Some(hooks) = self.hooks() {
			hooks.destroy(id);
		}
	}

	/// Runs a native callback for `id` the way a host does, between `before` and `after`.
	///
	/// Panics raised by the callback are caught, like a host's own uncaught error channel would.
	pub fn fire<R>(&self, id: AsyncId, callback: impl FnOnce() -> R) -> thread::Result<R> {
		self.before(id);
		let res = catch_unwind(AssertUnwindSafe(callback));
		self.after(id);

		res
	}

	/// Like [`FakeHost::fire`], but a panic escaping the callback goes through the host's
	/// uncaught error channel before `after`. `Ok(None)` when it got claimed there.
	pub fn fire_reporting<R>(
		&self,
		id: AsyncId,
		callback: impl FnOnce() -> R,
	) -> Result<Option<R>, WorkError> {
		self.before(id);
		let res = match catch_unwind(AssertUnwindSafe(callback)) {
			Ok(value) => Ok(Some(value)),
			Err(payload) => {
				let error = WorkError::from_panic(payload);
				match self.hooks() {
					Some(hooks) => hooks.uncaught(error).map(|()| None),
					None => Err(error),
				}
			}
		};
		self.after(id);

		res
	}
}

impl NativeHost for FakeHost {
	fn async_hooks_available(&self) -> Result<(), HostError> {
		if self.unavailable {
			Err(HostError::new("async hooks module not found"))
		} else {
			Ok(())
		}
	}

	fn register_hooks(&self, hooks: Arc<dyn AsyncHooks>) -> Result<(), HostError> {
		*self.hooks.lock().unwrap() = Some(hooks);
		Ok(())
	}
}

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn events() -> Events {
	Arc::new(Mutex::new(Vec::new()))
}

pub fn take(events: &Events) -> Vec<String> {
	std::mem::take(&mut *events.lock().unwrap())
}

/// Records `before`, `after` and `cancel` hooks as `<hook>:<task source>`, forwarding
/// cancellation so the task's own cancel side effect still runs.
pub fn recording_handler(events: &Events) -> Handler {
	Handler::new()
		.on_before_task({
			let events = Arc::clone(events);
			move |_, _, _, task| events.lock().unwrap().push(format!("before:{}", task.source()))
		})
		.on_after_task({
			let events = Arc::clone(events);
			move |_, _, _, task| events.lock().unwrap().push(format!("after:{}", task.source()))
		})
		.on_cancel_task({
			let events = Arc::clone(events);
			move |parent, _, target, task| {
				events
					.lock()
					.unwrap()
					.push(format!("cancel:{}", task.source()));
				parent.cancel_task(target, task)
			}
		})
}
