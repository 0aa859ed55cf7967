//! Bridge from a host runtime's native async notifications into the task lifecycle.
//!
//! Hosts schedule some operations (native timers, file system requests, promise jobs) outside
//! of any scheduling entry point we control. The [`NativeBridge`] listens to their lifecycle
//! notifications and mirrors each operation with a [`Task`] owned by the context that was
//! current when the operation got created, so the same context is current again when it runs.

use std::{
	any::Any,
	cell::RefCell,
	collections::HashMap,
	mem,
	panic::{self, catch_unwind, resume_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError, Weak,
	},
	thread::{self, ThreadId},
};

use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, error, trace, warn};

use super::{
	context::{BeforeRunStatus, Context},
	error::{panic_message, WorkError},
	flags::{self, Flags, Patch},
	task::{Task, TaskBuilder, TaskId, TaskState},
};

mod host;

pub use host::{probe_native_support, AsyncHooks, AsyncId, NativeHost, NativeKind};

/// A native operation between its `before` and `after` notifications.
struct RunningOperation {
	id: AsyncId,
	thread: ThreadId,
	task: Task,
	status: BeforeRunStatus,
}

impl RunningOperation {
	fn finish(self) {
		self.task.context().after_run_task(self.status, &self.task);
	}
}

struct BridgeInner {
	flags: Flags,
	active: AtomicBool,
	tasks: Mutex<HashMap<AsyncId, Task>>,
	// In the order they were entered, threads interleaved
	running: Mutex<Vec<RunningOperation>>,
}

impl BridgeInner {
	fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	fn task(&self, id: AsyncId) -> Option<Task> {
		self.tasks
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&id)
			.cloned()
	}

	fn is_running_here(&self, task_id: TaskId) -> bool {
		let thread = thread::current().id();

		self.running
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.any(|op| op.thread == thread && op.task.id() == task_id)
	}

	/// Takes the innermost run of `id` on this thread.
	///
	/// When runs entered after it on this thread are still going, the next one up inherits the
	/// frame it would have restored, so the last run to end restores what was current before
	/// all of them.
	fn take_running(&self, id: AsyncId) -> Option<RunningOperation> {
		let thread = thread::current().id();
		let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

		let pos = running
			.iter()
			.rposition(|op| op.thread == thread && op.id == id)?;
		let mut op = running.remove(pos);

		if let Some(above) = running[pos..].iter_mut().find(|above| above.thread == thread) {
			trace!(id, above_id = above.id, "Native operation ended before one entered after it");
			op.status.hand_over(&mut above.status);
		}

		Some(op)
	}

	fn pop_running(&self, thread: ThreadId) -> Option<RunningOperation> {
		let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

		let pos = running.iter().rposition(|op| op.thread == thread)?;

		Some(running.remove(pos))
	}

	fn operation_created(&self, id: AsyncId, kind: &str, trigger_id: AsyncId) {
		if !self.is_active() {
			return;
		}

		let kind = NativeKind::parse(kind);

		let Some(task_kind) = kind.task_kind() else {
			trace!(id, %kind, "Ignoring untracked native operation kind");
			return;
		};

		if let Some(patch) = kind.patch().filter(|patch| self.flags.is_disabled(*patch)) {
			trace!(id, %kind, %patch, "Ignoring native operation of a disabled category");
			return;
		}

		let context = Context::current();

		match context.schedule_task(TaskBuilder::new(task_kind, kind.as_str()).build_in(&context)) {
			Ok(task) => {
				trace!(id, trigger_id, %kind, task_id = %task.id(), context = context.name(), "Tracking native operation");
				if let Some(old) = self
					.tasks
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.insert(id, task)
				{
					warn!(id, old_task_id = %old.id(), "Native operation id reused before being destroyed");
				}
			}
			Err(e) => warn!(%e, id, %kind, "Failed to schedule task for native operation"),
		}
	}

	fn before_operation_runs(&self, id: AsyncId) {
		if !self.is_active() {
			return;
		}

		let Some(task) = self.task(id) else {
			return;
		};

		let res = task.context().before_run_task(&task);

		match res {
			Ok(Some(status)) => self
				.running
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.push(RunningOperation {
					id,
					thread: thread::current().id(),
					task,
					status,
				}),
			Ok(None) => trace!(id, task_id = %task.id(), "Native operation's task is no longer scheduled"),
			Err(e) => debug!(%e, id, "Native operation's task can't run"),
		}
	}

	/// Runs entered before a deactivation are still given back here.
	fn after_operation_runs(&self, id: AsyncId) {
		let Some(op) = self.take_running(id) else {
			if self.is_active() && self.task(id).is_some() {
				debug!(id, "After notification without a tracked before, ignoring");
			}
			return;
		};

		if take_deferred_panic().is_some() {
			trace!(id, "Panic raised during the native operation never reached the host");
		}

		op.finish();
	}

	fn operation_destroyed(&self, id: AsyncId) {
		if !self.is_active() {
			return;
		}

		let Some(task) = self
			.tasks
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&id)
		else {
			return;
		};

		if let Some(op) = self.take_running(id) {
			debug!(id, task_id = %task.id(), "Native operation destroyed mid-run, finishing the run");
			op.finish();
		}

		if task.state() == TaskState::Scheduled {
			trace!(id, task_id = %task.id(), "Canceling task of a destroyed native operation");
			if let Err(e) = task.cancel() {
				warn!(%e, id, "Failed to cancel task of a destroyed native operation");
			}
		}
	}

	/// Offers `error` to the owner of the current task, only if that task is mid-run through us.
	fn claim(&self, error: &WorkError) -> bool {
		if !self.is_active() {
			return false;
		}

		let Some(task) = Context::current_task() else {
			return false;
		};

		self.is_running_here(task.id()) && task.context().handle_error(error)
	}

	fn uncaught(&self, error: WorkError) -> Result<(), WorkError> {
		let report = take_deferred_panic();

		if self.claim(&error) {
			trace!(%error, "Uncaught error claimed by handler");
			return Ok(());
		}

		if let (Some(PanicReport { message, location }), WorkError::Panicked(_)) = (report, &error) {
			error!(
				%message,
				location = location.as_deref().unwrap_or("<unknown>"),
				"Uncaught panic in native operation"
			);
		}

		Err(error)
	}

	/// Finishes the runs this thread is in the middle of and cancels everything still scheduled.
	///
	/// Runs entered on other threads are finished by their own `after`.
	fn drain(&self) {
		let tasks = mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
		let thread = thread::current().id();

		let mut panicked = None;

		while let Some(op) = self.pop_running(thread) {
			debug!(id = op.id, task_id = %op.task.id(), "Finishing native operation run on deactivation");
			if let Err(payload) = catch_unwind(AssertUnwindSafe(|| op.finish())) {
				panicked.get_or_insert(payload);
			}
		}

		for (id, task) in tasks {
			if task.state() == TaskState::Scheduled {
				if let Err(e) = task.cancel() {
					warn!(%e, id, "Failed to cancel task of a native operation on deactivation");
				}
			}
		}

		if let Some(payload) = panicked {
			resume_unwind(payload);
		}
	}
}

/// What the host holds on to, it never keeps the bridge alive.
struct BridgeHooks(Weak<BridgeInner>);

impl AsyncHooks for BridgeHooks {
	fn init(&self, id: AsyncId, kind: &str, trigger_id: AsyncId) {
		if let Some(inner) = self.0.upgrade() {
			inner.operation_created(id, kind, trigger_id);
		}
	}

	fn before(&self, id: AsyncId) {
		if let Some(inner) = self.0.upgrade() {
			inner.before_operation_runs(id);
		}
	}

	fn after(&self, id: AsyncId) {
		if let Some(inner) = self.0.upgrade() {
			inner.after_operation_runs(id);
		}
	}

	fn destroy(&self, id: AsyncId) {
		if let Some(inner) = self.0.upgrade() {
			inner.operation_destroyed(id);
		}
	}

	fn uncaught(&self, error: WorkError) -> Result<(), WorkError> {
		match self.0.upgrade() {
			Some(inner) => inner.uncaught(error),
			None => Err(error),
		}
	}
}

#[derive(Debug)]
struct PanicReport {
	message: String,
	location: Option<String>,
}

static PANIC_OBSERVERS: Lazy<Mutex<Vec<Weak<BridgeInner>>>> = Lazy::new(|| Mutex::new(Vec::new()));
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

thread_local! {
	// Last panic raised inside a bridge-driven run, until we know whether it reached the host
	static DEFERRED_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

/// Registers `bridge` as a panic observer, installing the process panic hook the first time.
///
/// A panic raised while a bridge-driven task runs on this thread may still be caught before
/// it reaches the host, so its report is held back. It is emitted if the host hands the panic
/// to [`AsyncHooks::uncaught`] and nobody claims it, and discarded once the run ends otherwise.
/// Any other panic reaches the previously installed hook.
fn observe_panics(bridge: Weak<BridgeInner>) {
	{
		let mut observers = PANIC_OBSERVERS
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		observers.retain(|observer| observer.strong_count() > 0);
		observers.push(bridge);
	}

	PANIC_HOOK.get_or_init(|| {
		let previous = panic::take_hook();

		panic::set_hook(Box::new(move |info| {
			let location = info.location().map(ToString::to_string);
			if !defer_panic_report(info.payload(), location) {
				previous(info);
			}
		}));

		trace!("Installed panic hook");
	});
}

fn defer_panic_report(payload: &(dyn Any + Send), location: Option<String>) -> bool {
	let Some(task) = Context::current_task() else {
		return false;
	};

	// Never held while user code runs
	let observers = PANIC_OBSERVERS
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.iter()
		.filter_map(Weak::upgrade)
		.collect::<Vec<_>>();

	if !observers
		.iter()
		.any(|inner| inner.is_active() && inner.is_running_here(task.id()))
	{
		return false;
	}

	let report = PanicReport {
		message: panic_message(payload),
		location,
	};

	DEFERRED_PANIC
		.try_with(|slot| {
			slot.try_borrow_mut()
				.map(|mut slot| *slot = Some(report))
				.is_ok()
		})
		.unwrap_or(false)
}

fn take_deferred_panic() -> Option<PanicReport> {
	DEFERRED_PANIC
		.try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
		.ok()
		.flatten()
}

/// Mirrors a host's native asynchronous operations as tasks.
///
/// An inactive bridge, either because it was disabled or because the host lacks native async
/// notifications, turns every operation into a no-op.
#[must_use = "native operations stop being tracked when the bridge is dropped"]
pub struct NativeBridge {
	inner: Option<Arc<BridgeInner>>,
}

impl NativeBridge {
	/// Activates the bridge with the process-wide flags, as they are right now.
	pub fn activate(host: &impl NativeHost) -> Self {
		Self::activate_with(host, Flags::load())
	}

	pub fn activate_with(host: &impl NativeHost, flags: Flags) -> Self {
		if flags.native_async_hooks {
			debug!("Native async hooks disabled, bridge stays inactive");
			return Self { inner: None };
		}

		if !probe_native_support(host) {
			return Self { inner: None };
		}

		let inner = Arc::new(BridgeInner {
			flags,
			active: AtomicBool::new(true),
			tasks: Mutex::new(HashMap::new()),
			running: Mutex::new(Vec::new()),
		});

		if let Err(e) = host.register_hooks(Arc::new(BridgeHooks(Arc::downgrade(&inner)))) {
			warn!(%e, "Failed to register native async hooks, bridge stays inactive");
			flags::disable(Patch::NativeAsyncHooks);
			return Self { inner: None };
		}

		if !flags.unhandled_error {
			observe_panics(Arc::downgrade(&inner));
		}

		flags::set_native_hooks_active(true);
		debug!(?flags, "Native async bridge activated");

		Self { inner: Some(inner) }
	}

	#[must_use]
	pub fn is_active(&self) -> bool {
		self.inner.as_ref().is_some_and(|inner| inner.is_active())
	}

	/// The flags read at activation, `None` for a bridge that never activated.
	#[must_use]
	pub fn flags(&self) -> Option<Flags> {
		self.inner.as_ref().map(|inner| inner.flags)
	}

	/// How many native operations are currently mirrored by a task.
	#[must_use]
	pub fn tracked_operations(&self) -> usize {
		self.inner.as_ref().map_or(0, |inner| {
			inner
				.tasks
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.len()
		})
	}

	#[must_use]
	pub fn task(&self, id: AsyncId) -> Option<Task> {
		self.inner.as_ref().and_then(|inner| inner.task(id))
	}

	/// Creates and schedules a task in the current context for operations we track.
	pub fn operation_created(&self, id: AsyncId, kind: &str, trigger_id: AsyncId) {
		if let Some(inner) = &self.inner {
			inner.operation_created(id, kind, trigger_id);
		}
	}

	/// Enters the operation's context and fires `before_task`, an untracked id is a no-op.
	pub fn before_operation_runs(&self, id: AsyncId) {
		if let Some(inner) = &self.inner {
			inner.before_operation_runs(id);
		}
	}

	/// Fires `after_task` only if a matching before ran on this thread, then restores the
	/// context that was current before it.
	pub fn after_operation_runs(&self, id: AsyncId) {
		if let Some(inner) = &self.inner {
			inner.after_operation_runs(id);
		}
	}

	/// Stops tracking the id. A run still going on this thread is finished first, and a task
	/// still scheduled is canceled.
	pub fn operation_destroyed(&self, id: AsyncId) {
		if let Some(inner) = &self.inner {
			inner.operation_destroyed(id);
		}
	}

	/// Last-resort error observer for errors escaping a host callback, same as
	/// [`AsyncHooks::uncaught`].
	///
	/// The error is offered to the owner of the current task if that task is running through
	/// this bridge. It is given back when nobody claimed it, the host must rethrow it then.
	pub fn uncaught_error(&self, error: WorkError) -> Result<(), WorkError> {
		match &self.inner {
			Some(inner) => inner.uncaught(error),
			None => Err(error),
		}
	}

	/// Stops tracking anything, later notifications are ignored.
	///
	/// Runs this thread is in the middle of are finished, restoring the context that was
	/// current before them, and tasks still scheduled are canceled.
	pub fn deactivate(&self) {
		if let Some(inner) = &self.inner {
			if inner.active.swap(false, Ordering::AcqRel) {
				flags::set_native_hooks_active(false);
				debug!("Native async bridge deactivated");
				inner.drain();
			}
		}
	}
}

impl Drop for NativeBridge {
	fn drop(&mut self) {
		self.deactivate();
	}
}

impl std::fmt::Debug for NativeBridge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NativeBridge")
			.field("active", &self.is_active())
			.field("flags", &self.flags())
			.field("tracked_operations", &self.tracked_operations())
			.finish()
	}
}
