use std::{
	collections::HashMap,
	fmt,
	panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
	sync::{Arc, Mutex, PoisonError, RwLock},
};

use once_cell::sync::Lazy;
use tracing::{error, instrument, trace, warn};
use uuid::Uuid;

use super::{
	delegate::{Delegate, Handler},
	error::{Error, WorkError},
	task::{CancelFn, ScheduleFn, Task, TaskBuilder, TaskCounts, TaskId, TaskKind, TaskState},
};

mod current;
mod future;
mod property;

pub(crate) use current::Frame;

pub use future::{spawn, InContext, WithContext};
pub use property::Property;

/// A unique identifier for a context using the [`uuid`](https://docs.rs/uuid) crate.
pub type ContextId = Uuid;

static ROOT: Lazy<Context> = Lazy::new(|| Context::from_spec(None, ContextSpec::new("<root>")));

/// Everything needed to create a child [`Context`] through [`Context::fork`].
#[derive(Debug, Default)]
pub struct ContextSpec {
	name: String,
	handler: Option<Handler>,
	properties: HashMap<String, Arc<dyn Property>>,
}

impl ContextSpec {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Default::default()
		}
	}

	#[must_use]
	pub fn with_handler(mut self, handler: Handler) -> Self {
		self.handler = Some(handler);
		self
	}

	#[must_use]
	pub fn with_property(mut self, key: impl Into<String>, value: impl Property) -> Self {
		self.properties.insert(key.into(), Arc::new(value));
		self
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub const fn handler(&self) -> Option<&Handler> {
		self.handler.as_ref()
	}
}

struct Inner {
	id: ContextId,
	name: String,
	parent: Option<Context>,
	handler: Option<Handler>,
	properties: RwLock<HashMap<String, Arc<dyn Property>>>,
	task_counts: Mutex<TaskCounts>,
}

/// A node in the tree of execution contexts.
///
/// Contexts are immutable after creation, except for their property bag. Cloning is cheap and
/// equality is identity: two handles are equal only if they refer to the same node.
#[derive(Clone)]
pub struct Context {
	inner: Arc<Inner>,
}

/// Token returned by [`Context::before_run_task`] that must be handed back to
/// [`Context::after_run_task`] once the task's work finished running.
///
/// Dropping it without calling `after_run_task` leaves the task's context as the current one.
#[derive(Debug)]
#[must_use = "the task keeps running until the status is given back to `after_run_task`"]
pub struct BeforeRunStatus {
	previous: Option<Frame>,
	task_id: TaskId,
}

impl BeforeRunStatus {
	#[must_use]
	pub const fn task_id(&self) -> TaskId {
		self.task_id
	}

	/// For a run ending while runs entered after it are still going: the run right above
	/// inherits the frame this one would have restored, and this one leaves the current frame
	/// untouched.
	pub(crate) fn hand_over(&mut self, above: &mut Self) {
		above.previous = self.previous.take();
		self.previous = current::frame();
	}
}

/// Completes a task run even if a hook unwinds through [`Context::run_task`].
struct FinishRun<'a> {
	context: &'a Context,
	task: &'a Task,
}

impl Drop for FinishRun<'_> {
	fn drop(&mut self) {
		self.context.finish_run(self.task);
	}
}

impl Context {
	fn from_spec(parent: Option<Self>, spec: ContextSpec) -> Self {
		let ContextSpec {
			name,
			handler,
			properties,
		} = spec;

		Self {
			inner: Arc::new(Inner {
				id: ContextId::new_v4(),
				name,
				parent,
				handler,
				properties: RwLock::new(properties),
				task_counts: Mutex::new(TaskCounts::default()),
			}),
		}
	}

	pub(crate) fn new_child(parent: &Self, spec: ContextSpec) -> Self {
		trace!(parent = parent.name(), name = spec.name(), "Creating child context");
		Self::from_spec(Some(parent.clone()), spec)
	}

	/// The single root context of this process.
	#[must_use]
	pub fn root() -> Self {
		ROOT.clone()
	}

	/// The context currently active on this thread, the root one if nothing was entered.
	#[must_use]
	pub fn current() -> Self {
		current::context().unwrap_or_else(Self::root)
	}

	/// The task currently running on this thread, if any.
	#[must_use]
	pub fn current_task() -> Option<Task> {
		current::task()
	}

	#[must_use]
	pub fn id(&self) -> ContextId {
		self.inner.id
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	#[must_use]
	pub fn parent(&self) -> Option<&Self> {
		self.inner.parent.as_ref()
	}

	#[must_use]
	pub fn is_root(&self) -> bool {
		self.inner.parent.is_none()
	}

	#[must_use]
	pub fn handler(&self) -> Option<&Handler> {
		self.inner.handler.as_ref()
	}

	/// This context followed by all of its ancestors, up to the root.
	pub fn lineage(&self) -> impl Iterator<Item = &Self> {
		std::iter::successors(Some(self), |context| context.parent())
	}

	/// Outstanding tasks owned by this context and its descendants.
	#[must_use]
	pub fn task_counts(&self) -> TaskCounts {
		*self
			.inner
			.task_counts
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	fn local(&self, key: &str) -> Option<Arc<dyn Property>> {
		self.inner
			.properties
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(key)
			.cloned()
	}

	/// Looks up a property on this context, falling back to its ancestors.
	#[must_use]
	pub fn get(&self, key: &str) -> Option<Arc<dyn Property>> {
		self.lineage().find_map(|context| context.local(key))
	}

	/// Same as [`Context::get`] but downcasts the found value, `None` if it has another type.
	#[must_use]
	pub fn get_as<T: Property>(&self, key: &str) -> Option<Arc<T>> {
		self.get(key)?.downcast_arc::<T>().ok()
	}

	/// Sets a property on this context only, ancestors are never touched.
	pub fn set(&self, key: impl Into<String>, value: impl Property) {
		self.inner
			.properties
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key.into(), Arc::new(value));
	}

	/// The nearest context in this lineage holding `key`.
	#[must_use]
	pub fn context_with(&self, key: &str) -> Option<Self> {
		self.lineage()
			.find(|context| {
				context
					.inner
					.properties
					.read()
					.unwrap_or_else(PoisonError::into_inner)
					.contains_key(key)
			})
			.cloned()
	}

	/// Resolves hooks starting from this context.
	#[must_use]
	pub fn delegate(&self) -> Delegate<'_> {
		Delegate::new(Some(self))
	}

	/// Resolves hooks starting from this context's parent, what a hook defined here receives.
	#[must_use]
	pub fn parent_delegate(&self) -> Delegate<'_> {
		Delegate::new(self.parent())
	}

	/// Creates a child context, `fork` hooks along the lineage may wrap or replace it.
	#[must_use]
	pub fn fork(&self, spec: ContextSpec) -> Self {
		self.delegate().fork(self, spec)
	}

	/// Runs `work` with this context as the current one, restoring the previous one on every
	/// exit path, unwinding included.
	pub fn run<R>(&self, work: impl FnOnce() -> R) -> R {
		let _guard = current::enter(Frame::new(self.clone(), current::task()));
		work()
	}

	/// Like [`Context::run`], but errors and panics raised by `work` are offered to `handle_error`.
	///
	/// Returns `Ok(None)` when a handler claimed the error.
	pub fn run_guarded<R>(
		&self,
		work: impl FnOnce() -> Result<R, WorkError>,
	) -> Result<Option<R>, WorkError> {
		self.run(|| {
			let error = match catch_unwind(AssertUnwindSafe(work)) {
				Ok(Ok(value)) => return Ok(Some(value)),
				Ok(Err(e)) => e,
				Err(payload) => WorkError::from_panic(payload),
			};

			if self.handle_error(&error) {
				trace!(context = self.name(), %error, "Error claimed by handler");
				Ok(None)
			} else {
				Err(error)
			}
		})
	}

	/// Binds `callback` to this context, after passing it through the `intercept` hooks.
	///
	/// The returned callback always runs guarded inside this context, wherever it's called from.
	pub fn wrap(
		&self,
		callback: impl FnMut() -> Result<(), WorkError> + Send + 'static,
		source: &str,
	) -> impl FnMut() -> Result<(), WorkError> + Send + 'static {
		let mut callback = self.delegate().intercept(self, Box::new(callback), source);
		let context = self.clone();

		move || context.run_guarded(&mut callback).map(|_| ())
	}

	/// `true` if some handler along the lineage claimed the error.
	pub fn handle_error(&self, error: &WorkError) -> bool {
		self.delegate().handle_error(self, error)
	}

	fn check_owner(&self, task: &Task) -> Result<(), Error> {
		if task.context() == self {
			Ok(())
		} else {
			Err(Error::ForeignTask {
				task_id: task.id(),
				owner: task.context().name().to_string(),
				target: self.name().to_string(),
			})
		}
	}

	/// Schedules a task owned by this context through the `schedule_task` hooks.
	///
	/// Hooks may hand back another task, which is the one that ends up scheduled and returned.
	#[instrument(skip_all, fields(context = %self.name(), task_id = %task.id(), kind = %task.kind()))]
	pub fn schedule_task(&self, task: Task) -> Result<Task, Error> {
		self.check_owner(&task)?;
		task.transition(TaskState::Scheduling, &[TaskState::NotScheduled])?;

		let res = catch_unwind(AssertUnwindSafe(|| {
			self.delegate().schedule_task(self, task.clone())
		}));

		match res {
			Ok(Ok(scheduled)) => {
				if !scheduled.ptr_eq(&task) {
					trace!(replacement_id = %scheduled.id(), "Task replaced by a schedule hook");
					if let Err(e) = task.transition(TaskState::NotScheduled, &[TaskState::Scheduling]) {
						warn!(%e, "Replaced task changed state while being scheduled");
					}
				}

				scheduled.transition(
					TaskState::Scheduled,
					&[TaskState::Scheduling, TaskState::NotScheduled],
				)?;
				scheduled
					.context()
					.update_task_count(scheduled.kind(), 1);

				Ok(scheduled)
			}
			Ok(Err(e)) => {
				revert_scheduling(&task);
				Err(e)
			}
			Err(payload) => {
				revert_scheduling(&task);
				resume_unwind(payload)
			}
		}
	}

	pub fn schedule_micro_task(
		&self,
		source: &str,
		work: impl FnMut(&Task) -> Result<(), WorkError> + Send + 'static,
	) -> Result<Task, Error> {
		self.schedule_task(TaskBuilder::new(TaskKind::Micro, source).work(work).build_in(self))
	}

	pub fn schedule_macro_task(
		&self,
		source: &str,
		work: impl FnMut(&Task) -> Result<(), WorkError> + Send + 'static,
		schedule_fn: Option<ScheduleFn>,
		cancel_fn: Option<CancelFn>,
	) -> Result<Task, Error> {
		self.schedule_task(
			TaskBuilder::new(TaskKind::Macro, source)
				.work(work)
				.side_effects(schedule_fn, cancel_fn)
				.build_in(self),
		)
	}

	pub fn schedule_event_task(
		&self,
		source: &str,
		work: impl FnMut(&Task) -> Result<(), WorkError> + Send + 'static,
		schedule_fn: Option<ScheduleFn>,
		cancel_fn: Option<CancelFn>,
	) -> Result<Task, Error> {
		self.schedule_task(
			TaskBuilder::new(TaskKind::Event, source)
				.work(work)
				.side_effects(schedule_fn, cancel_fn)
				.build_in(self),
		)
	}

	/// Moves a task into [`TaskState::Running`], `false` if a canceled macro or event task
	/// must be skipped instead.
	fn begin_run(&self, task: &Task) -> Result<bool, Error> {
		if task.kind() != TaskKind::Micro && task.state() == TaskState::NotScheduled {
			trace!(context = self.name(), task_id = %task.id(), "Task is no longer scheduled, skipping run");
			return Ok(false);
		}

		task.transition(TaskState::Running, &[TaskState::Scheduled])?;
		task.increment_run_count();

		Ok(true)
	}

	fn finish_run(&self, task: &Task) {
		if task.is_recurring() {
			if let Err(e) = task.transition(TaskState::Scheduled, &[TaskState::Running]) {
				warn!(%e, "Recurring task left the running state during its run");
			}
		} else if task
			.transition(TaskState::NotScheduled, &[TaskState::Running])
			.is_ok()
		{
			task.reset_run_count();
			self.update_task_count(task.kind(), -1);
		}
	}

	/// Runs a task owned by this context, with it as the current context and task.
	///
	/// Errors raised by the work never skip the state transition. Once it's done they are
	/// offered to `handle_error`, and come back as [`Error::Unhandled`] when nobody claims them.
	#[instrument(skip_all, fields(context = %self.name(), task_id = %task.id(), kind = %task.kind()))]
	pub fn run_task(&self, task: &Task) -> Result<(), Error> {
		self.check_owner(task)?;

		if !self.begin_run(task)? {
			return Ok(());
		}

		let _frame = current::enter(Frame::new(self.clone(), Some(task.clone())));
		let finish = FinishRun {
			context: self,
			task,
		};

		let delegate = self.delegate();

		delegate.before_task(self, task);
		let res = catch_unwind(AssertUnwindSafe(|| delegate.invoke_task(self, task)))
			.unwrap_or_else(|payload| Err(WorkError::from_panic(payload)));
		delegate.after_task(self, task);

		drop(finish);

		match res {
			Ok(()) => Ok(()),
			Err(e) if self.handle_error(&e) => {
				trace!(%e, "Task error claimed by handler");
				Ok(())
			}
			Err(e) => {
				error!(%e, "Unhandled error on task work");
				Err(Error::Unhandled(e))
			}
		}
	}

	/// Cancels a scheduled task owned by this context, a task that isn't scheduled is left alone.
	#[instrument(skip_all, fields(context = %self.name(), task_id = %task.id(), kind = %task.kind()))]
	pub fn cancel_task(&self, task: &Task) -> Result<(), Error> {
		self.check_owner(task)?;

		match task.transition(TaskState::Canceling, &[TaskState::Scheduled]) {
			Ok(()) => {}
			Err(Error::InvalidTransition {
				from: TaskState::NotScheduled,
				..
			}) => {
				trace!("Task isn't scheduled, nothing to cancel");
				return Ok(());
			}
			Err(e) => return Err(e),
		}

		let res = catch_unwind(AssertUnwindSafe(|| self.delegate().cancel_task(self, task)));

		if task
			.transition(TaskState::NotScheduled, &[TaskState::Canceling])
			.is_ok()
		{
			task.reset_run_count();
			self.update_task_count(task.kind(), -1);
		}

		res.unwrap_or_else(|payload| resume_unwind(payload))
	}

	/// First half of a task run driven from outside, like a host notification.
	///
	/// Enters this context with the task as current and fires `before_task`. Returns `None`
	/// for canceled macro and event tasks, which must not run.
	pub fn before_run_task(&self, task: &Task) -> Result<Option<BeforeRunStatus>, Error> {
		self.check_owner(task)?;

		if !self.begin_run(task)? {
			return Ok(None);
		}

		let previous = current::replace(Some(Frame::new(self.clone(), Some(task.clone()))));

		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| {
			self.delegate().before_task(self, task);
		})) {
			current::replace(previous);
			self.finish_run(task);
			resume_unwind(payload);
		}

		Ok(Some(BeforeRunStatus {
			previous,
			task_id: task.id(),
		}))
	}

	/// Second half of [`Context::before_run_task`], fires `after_task` and restores the
	/// previously current context.
	pub fn after_run_task(&self, status: BeforeRunStatus, task: &Task) {
		let BeforeRunStatus { previous, task_id } = status;

		if task_id != task.id() {
			warn!(
				%task_id,
				given_task_id = %task.id(),
				"Run status given back for another task"
			);
		}

		let res = catch_unwind(AssertUnwindSafe(|| {
			let _frame = current::enter(Frame::new(self.clone(), Some(task.clone())));
			self.delegate().after_task(self, task);
		}));

		self.finish_run(task);
		current::replace(previous);

		if let Err(payload) = res {
			resume_unwind(payload);
		}
	}

	/// Takes a scheduled task out of the schedule without going through the `cancel_task`
	/// hooks, for tasks whose driver is gone.
	pub(crate) fn retire_task(&self, task: &Task) {
		if task
			.transition(
				TaskState::NotScheduled,
				&[TaskState::Scheduled, TaskState::Running],
			)
			.is_ok()
		{
			trace!(context = self.name(), task_id = %task.id(), "Retired task");
			task.reset_run_count();
			self.update_task_count(task.kind(), -1);
		}
	}

	/// Applies `delta` to the outstanding count of `kind` along the whole lineage, notifying
	/// each context whose count crossed zero through its own `has_task` hook.
	pub(crate) fn update_task_count(&self, kind: TaskKind, delta: isize) {
		for context in self.lineage() {
			let crossed = {
				let mut counts = context
					.inner
					.task_counts
					.lock()
					.unwrap_or_else(PoisonError::into_inner);

				counts
					.apply(kind, delta)
					.then(|| counts.has_task_state(kind))
			};

			if let Some(state) = crossed {
				trace!(context = context.name(), ?state, "Pending tasks changed");
				if let Some(hook) = context.handler().and_then(Handler::has_task_hook) {
					hook(&context.parent_delegate(), context, self, state);
				}
			}
		}
	}
}

fn revert_scheduling(task: &Task) {
	if let Err(e) = task.transition(TaskState::NotScheduled, &[TaskState::Scheduling]) {
		warn!(%e, "Failed to revert a task that couldn't be scheduled");
	}
}

impl PartialEq for Context {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Context {}

impl fmt::Debug for Context {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Context")
			.field("id", &self.inner.id)
			.field("name", &self.inner.name)
			.field("parent", &self.parent().map(Self::name))
			.field("handler", &self.inner.handler)
			.finish_non_exhaustive()
	}
}
