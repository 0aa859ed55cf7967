use std::{
	fmt,
	panic::{catch_unwind, AssertUnwindSafe},
	str::FromStr,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex, PoisonError,
	},
};

use tracing::{trace, warn};
use uuid::Uuid;

use super::{
	context::Context,
	error::{Error, WorkError},
};

/// A unique identifier for a task using the [`uuid`](https://docs.rs/uuid) crate.
pub type TaskId = Uuid;

/// The deferred work carried by a [`Task`], it can be invoked many times for recurring tasks.
pub type Work = Box<dyn FnMut(&Task) -> Result<(), WorkError> + Send>;

/// Side effect that hands a task to whatever will eventually run it.
pub type ScheduleFn = Box<dyn FnMut(&Task) -> Result<(), Error> + Send>;

/// Side effect run when a scheduled task gets canceled.
pub type CancelFn = Box<dyn FnMut(&Task) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
	/// Runs before the host yields back to its outer event loop, like deferred-value callbacks.
	Micro,
	/// Scheduled through event-loop-level primitives, like timers and I/O completions.
	Macro,
	/// Listener style work, it runs every time its event fires until canceled.
	Event,
}

impl FromStr for TaskKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"micro" | "microTask" => Ok(Self::Micro),
			"macro" | "macroTask" => Ok(Self::Macro),
			"event" | "eventTask" => Ok(Self::Event),
			other => Err(Error::InvalidArgument(format!("unknown task kind: '{other}'"))),
		}
	}
}

impl fmt::Display for TaskKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Micro => write!(f, "microTask"),
			Self::Macro => write!(f, "macroTask"),
			Self::Event => write!(f, "eventTask"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
	NotScheduled,
	Scheduling,
	Scheduled,
	Running,
	Canceling,
}

impl fmt::Display for TaskState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotScheduled => write!(f, "notScheduled"),
			Self::Scheduling => write!(f, "scheduling"),
			Self::Scheduled => write!(f, "scheduled"),
			Self::Running => write!(f, "running"),
			Self::Canceling => write!(f, "canceling"),
		}
	}
}

/// Outstanding tasks per kind, for a context and all of its descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
	pub micro_tasks: usize,
	pub macro_tasks: usize,
	pub event_tasks: usize,
}

impl TaskCounts {
	#[must_use]
	pub const fn get(&self, kind: TaskKind) -> usize {
		match kind {
			TaskKind::Micro => self.micro_tasks,
			TaskKind::Macro => self.macro_tasks,
			TaskKind::Event => self.event_tasks,
		}
	}

	/// Applies `delta` to the count of `kind`, returning whether the count went
	/// from zero to non-zero or the other way around.
	pub(crate) fn apply(&mut self, kind: TaskKind, delta: isize) -> bool {
		let count = match kind {
			TaskKind::Micro => &mut self.micro_tasks,
			TaskKind::Macro => &mut self.macro_tasks,
			TaskKind::Event => &mut self.event_tasks,
		};

		let before = *count;
		*count = before.saturating_add_signed(delta);

		(before == 0) != (*count == 0)
	}

	pub(crate) const fn has_task_state(&self, change: TaskKind) -> HasTaskState {
		HasTaskState {
			micro_task: self.micro_tasks > 0,
			macro_task: self.macro_tasks > 0,
			event_task: self.event_tasks > 0,
			change,
		}
	}
}

/// Snapshot handed to `has_task` hooks whenever a kind of task starts or stops being pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct HasTaskState {
	pub micro_task: bool,
	pub macro_task: bool,
	pub event_task: bool,
	pub change: TaskKind,
}

struct Inner {
	id: TaskId,
	kind: TaskKind,
	source: String,
	context: Context,
	periodic: bool,
	state: Mutex<TaskState>,
	run_count: AtomicUsize,
	work: Mutex<Option<Work>>,
	schedule_fn: Mutex<Option<ScheduleFn>>,
	cancel_fn: Mutex<Option<CancelFn>>,
}

/// A tracked unit of deferred work, bound for life to the [`Context`] that was current when
/// it was created.
///
/// Cloning a task is cheap and every clone refers to the same unit of work.
#[derive(Clone)]
pub struct Task {
	inner: Arc<Inner>,
}

impl Task {
	/// Creates a task in the current context from a textual kind, as hosts usually report them.
	pub fn create(
		kind: &str,
		source: impl Into<String>,
		work: impl FnMut(&Self) -> Result<(), WorkError> + Send + 'static,
		cancel: Option<CancelFn>,
	) -> Result<Self, Error> {
		Ok(TaskBuilder::new(kind.parse()?, source)
			.work(work)
			.side_effects(None, cancel)
			.build())
	}

	#[must_use]
	pub fn id(&self) -> TaskId {
		self.inner.id
	}

	#[must_use]
	pub fn kind(&self) -> TaskKind {
		self.inner.kind
	}

	#[must_use]
	pub fn source(&self) -> &str {
		&self.inner.source
	}

	/// The context that owns this task, it never changes.
	#[must_use]
	pub fn context(&self) -> &Context {
		&self.inner.context
	}

	#[must_use]
	pub fn state(&self) -> TaskState {
		*self
			.inner
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	#[must_use]
	pub fn is_periodic(&self) -> bool {
		self.inner.periodic
	}

	/// Recurring tasks go back to [`TaskState::Scheduled`] after each run.
	#[must_use]
	pub fn is_recurring(&self) -> bool {
		self.inner.periodic || self.inner.kind == TaskKind::Event
	}

	/// How many times this task ran since it was last scheduled.
	#[must_use]
	pub fn run_count(&self) -> usize {
		self.inner.run_count.load(Ordering::Acquire)
	}

	pub fn schedule(&self) -> Result<Self, Error> {
		self.context().schedule_task(self.clone())
	}

	pub fn run(&self) -> Result<(), Error> {
		self.context().run_task(self)
	}

	pub fn cancel(&self) -> Result<(), Error> {
		self.context().cancel_task(self)
	}

	#[must_use]
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	pub(crate) fn transition(&self, to: TaskState, from: &[TaskState]) -> Result<(), Error> {
		let mut state = self
			.inner
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner);

		if from.contains(&state) {
			trace!(task_id = %self.inner.id, from = %*state, %to, "Task state transition");
			*state = to;
			Ok(())
		} else {
			Err(Error::InvalidTransition {
				task_id: self.inner.id,
				from: *state,
				to,
			})
		}
	}

	pub(crate) fn increment_run_count(&self) {
		self.inner.run_count.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn reset_run_count(&self) {
		self.inner.run_count.store(0, Ordering::Release);
	}

	/// Calls the task's work, panics are caught and converted into [`WorkError::Panicked`].
	pub(crate) fn invoke_work(&self) -> Result<(), WorkError> {
		let Some(mut work) = self
			.inner
			.work
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		else {
			trace!(task_id = %self.inner.id, "Task has no work to invoke");
			return Ok(());
		};

		let res = catch_unwind(AssertUnwindSafe(|| work(self)))
			.unwrap_or_else(|payload| Err(WorkError::from_panic(payload)));

		*self
			.inner
			.work
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(work);

		res
	}

	pub(crate) fn run_schedule_fn(&self) -> Result<(), Error> {
		let maybe_schedule_fn = self
			.inner
			.schedule_fn
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		if let Some(mut schedule_fn) = maybe_schedule_fn {
			let res = schedule_fn(self);

			*self
				.inner
				.schedule_fn
				.lock()
				.unwrap_or_else(PoisonError::into_inner) = Some(schedule_fn);

			res
		} else {
			Ok(())
		}
	}

	pub(crate) fn run_cancel_fn(&self) {
		let maybe_cancel_fn = self
			.inner
			.cancel_fn
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		if let Some(mut cancel_fn) = maybe_cancel_fn {
			cancel_fn(self);

			*self
				.inner
				.cancel_fn
				.lock()
				.unwrap_or_else(PoisonError::into_inner) = Some(cancel_fn);
		}
	}
}

impl PartialEq for Task {
	fn eq(&self, other: &Self) -> bool {
		self.ptr_eq(other)
	}
}

impl Eq for Task {}

impl fmt::Debug for Task {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Task")
			.field("id", &self.inner.id)
			.field("kind", &self.inner.kind)
			.field("source", &self.inner.source)
			.field("state", &self.state())
			.field("context", &self.inner.context.name())
			.field("periodic", &self.inner.periodic)
			.finish_non_exhaustive()
	}
}

/// Builds a [`Task`] before it gets bound to its owning context.
pub struct TaskBuilder {
	kind: TaskKind,
	source: String,
	periodic: bool,
	work: Option<Work>,
	schedule_fn: Option<ScheduleFn>,
	cancel_fn: Option<CancelFn>,
}

impl TaskBuilder {
	pub fn new(kind: TaskKind, source: impl Into<String>) -> Self {
		Self {
			kind,
			source: source.into(),
			periodic: false,
			work: None,
			schedule_fn: None,
			cancel_fn: None,
		}
	}

	#[must_use]
	pub fn work(mut self, work: impl FnMut(&Task) -> Result<(), WorkError> + Send + 'static) -> Self {
		self.work = Some(Box::new(work));
		self
	}

	#[must_use]
	pub fn on_schedule(
		mut self,
		schedule_fn: impl FnMut(&Task) -> Result<(), Error> + Send + 'static,
	) -> Self {
		self.schedule_fn = Some(Box::new(schedule_fn));
		self
	}

	#[must_use]
	pub fn on_cancel(mut self, cancel_fn: impl FnMut(&Task) + Send + 'static) -> Self {
		self.cancel_fn = Some(Box::new(cancel_fn));
		self
	}

	pub(crate) fn side_effects(
		mut self,
		schedule_fn: Option<ScheduleFn>,
		cancel_fn: Option<CancelFn>,
	) -> Self {
		self.schedule_fn = schedule_fn;
		self.cancel_fn = cancel_fn;
		self
	}

	/// Only macro tasks can be periodic.
	#[must_use]
	pub fn periodic(mut self, periodic: bool) -> Self {
		if periodic && self.kind != TaskKind::Macro {
			warn!(kind = %self.kind, "Only macro tasks can be periodic, ignoring");
		} else {
			self.periodic = periodic;
		}
		self
	}

	/// Binds the task to the current context.
	#[must_use]
	pub fn build(self) -> Task {
		self.build_in(&Context::current())
	}

	#[must_use]
	pub fn build_in(self, context: &Context) -> Task {
		let Self {
			kind,
			source,
			periodic,
			work,
			schedule_fn,
			cancel_fn,
		} = self;

		Task {
			inner: Arc::new(Inner {
				id: TaskId::new_v4(),
				kind,
				source,
				context: context.clone(),
				periodic,
				state: Mutex::new(TaskState::NotScheduled),
				run_count: AtomicUsize::new(0),
				work: Mutex::new(work),
				schedule_fn: Mutex::new(schedule_fn),
				cancel_fn: Mutex::new(cancel_fn),
			}),
		}
	}
}

impl fmt::Debug for TaskBuilder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TaskBuilder")
			.field("kind", &self.kind)
			.field("source", &self.source)
			.field("periodic", &self.periodic)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;

	use super::*;

	#[test]
	fn kind_parsing() {
		assert_eq!("microTask".parse::<TaskKind>().unwrap(), TaskKind::Micro);
		assert_eq!("macro".parse::<TaskKind>().unwrap(), TaskKind::Macro);
		assert_eq!("eventTask".parse::<TaskKind>().unwrap(), TaskKind::Event);
		assert!(matches!(
			"idleTask".parse::<TaskKind>(),
			Err(Error::InvalidArgument(_))
		));
	}

	#[test]
	fn create_rejects_unknown_kind() {
		assert!(matches!(
			Task::create("bogus", "test", |_| Ok(()), None),
			Err(Error::InvalidArgument(_))
		));
	}

	#[test]
	fn created_task_starts_not_scheduled_in_current_context() {
		let context = Context::root().fork(crate::ContextSpec::new("creator"));

		let task = context.run(|| Task::create("macroTask", "test", |_| Ok(()), None).unwrap());

		assert_eq!(task.state(), TaskState::NotScheduled);
		assert_eq!(task.context(), &context);
		assert_eq!(task.run_count(), 0);
	}

	#[test]
	fn transitions_are_checked() {
		let task = TaskBuilder::new(TaskKind::Micro, "test").build();

		assert!(matches!(
			task.transition(TaskState::Running, &[TaskState::Scheduled]),
			Err(Error::InvalidTransition {
				from: TaskState::NotScheduled,
				to: TaskState::Running,
				..
			})
		));

		task.transition(TaskState::Scheduling, &[TaskState::NotScheduled])
			.unwrap();
		assert_eq!(task.state(), TaskState::Scheduling);
	}

	#[test]
	fn invoke_work_survives_panics() {
		let calls = Arc::new(AtomicUsize::new(0));

		let task = TaskBuilder::new(TaskKind::Macro, "test")
			.work({
				let calls = Arc::clone(&calls);
				move |_| {
					if calls.fetch_add(1, Ordering::SeqCst) == 0 {
						panic!("first call panics");
					}
					Ok(())
				}
			})
			.build();

		assert!(matches!(task.invoke_work(), Err(WorkError::Panicked(_))));
		// The work must be put back even after a panic
		assert!(task.invoke_work().is_ok());
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn only_macro_tasks_are_periodic() {
		let micro = TaskBuilder::new(TaskKind::Micro, "test").periodic(true).build();
		assert!(!micro.is_periodic());
		assert!(!micro.is_recurring());

		let interval = TaskBuilder::new(TaskKind::Macro, "test").periodic(true).build();
		assert!(interval.is_periodic());
		assert!(interval.is_recurring());

		let event = TaskBuilder::new(TaskKind::Event, "test").build();
		assert!(event.is_recurring());
	}

	#[test]
	fn side_effects_are_reusable() {
		let canceled = Arc::new(AtomicBool::new(false));

		let task = TaskBuilder::new(TaskKind::Macro, "test")
			.on_cancel({
				let canceled = Arc::clone(&canceled);
				move |_| canceled.store(true, Ordering::SeqCst)
			})
			.on_schedule(|_| Ok(()))
			.build();

		task.run_schedule_fn().unwrap();
		task.run_cancel_fn();

		assert!(canceled.load(Ordering::SeqCst));
	}

	#[test]
	fn counts_report_zero_crossings() {
		let mut counts = TaskCounts::default();

		assert!(counts.apply(TaskKind::Macro, 1));
		assert!(!counts.apply(TaskKind::Macro, 1));
		assert!(!counts.apply(TaskKind::Macro, -1));
		assert!(counts.apply(TaskKind::Macro, -1));
		assert_eq!(counts.get(TaskKind::Macro), 0);

		// never underflows
		assert!(!counts.apply(TaskKind::Micro, -1));
		assert_eq!(counts.get(TaskKind::Micro), 0);

		counts.apply(TaskKind::Event, 1);
		let state = counts.has_task_state(TaskKind::Event);
		assert!(state.event_task);
		assert!(!state.micro_task);
		assert_eq!(state.change, TaskKind::Event);
	}
}
