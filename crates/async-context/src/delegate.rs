//! Interception hooks and their nearest-ancestor resolution.
//!
//! Every [`Context`] may carry a [`Handler`] implementing any subset of the hooks. When an
//! operation hits a context, the [`Delegate`] walks from that context up through its ancestors
//! and dispatches to the first handler defining the hook. That handler is authoritative: it
//! receives the parent delegate and decides whether to continue down the chain, transform the
//! operation or short-circuit it.
//!
//! All hooks receive, in order, the parent delegate, the context that defined the hook and the
//! target context the operation was originally invoked on.

use std::{fmt, sync::Arc};

use tracing::trace;

use super::{
	context::{Context, ContextSpec},
	error::{Error, WorkError},
	task::{HasTaskState, Task},
};

/// A callback wrapped by [`Context::wrap`] and handed to `intercept` hooks.
pub type Callback = Box<dyn FnMut() -> Result<(), WorkError> + Send>;

pub type ForkHook =
	Arc<dyn Fn(&Delegate<'_>, &Context, &Context, ContextSpec) -> Context + Send + Sync>;
pub type InterceptHook =
	Arc<dyn Fn(&Delegate<'_>, &Context, &Context, Callback, &str) -> Callback + Send + Sync>;
pub type ScheduleTaskHook =
	Arc<dyn Fn(&Delegate<'_>, &Context, &Context, Task) -> Result<Task, Error> + Send + Sync>;
pub type InvokeTaskHook =
	Arc<dyn Fn(&Delegate<'_>, &Context, &Context, &Task) -> Result<(), WorkError> + Send + Sync>;
pub type CancelTaskHook =
	Arc<dyn Fn(&Delegate<'_>, &Context, &Context, &Task) -> Result<(), Error> + Send + Sync>;
pub type HandleErrorHook =
	Arc<dyn Fn(&Delegate<'_>, &Context, &Context, &WorkError) -> bool + Send + Sync>;
pub type TaskHook = Arc<dyn Fn(&Delegate<'_>, &Context, &Context, &Task) + Send + Sync>;
pub type HasTaskHook = Arc<dyn Fn(&Delegate<'_>, &Context, &Context, HasTaskState) + Send + Sync>;

/// A set of optional interception hooks contributed by a context.
#[derive(Clone, Default)]
pub struct Handler {
	fork: Option<ForkHook>,
	intercept: Option<InterceptHook>,
	schedule_task: Option<ScheduleTaskHook>,
	invoke_task: Option<InvokeTaskHook>,
	cancel_task: Option<CancelTaskHook>,
	handle_error: Option<HandleErrorHook>,
	before_task: Option<TaskHook>,
	after_task: Option<TaskHook>,
	has_task: Option<HasTaskHook>,
}

impl Handler {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Intercepts child creation, the hook may wrap or replace the child's spec.
	#[must_use]
	pub fn on_fork(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, ContextSpec) -> Context
			+ Send
			+ Sync
			+ 'static,
	) -> Self {
		self.fork = Some(Arc::new(hook));
		self
	}

	/// Intercepts callbacks passed to [`Context::wrap`].
	#[must_use]
	pub fn on_intercept(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, Callback, &str) -> Callback
			+ Send
			+ Sync
			+ 'static,
	) -> Self {
		self.intercept = Some(Arc::new(hook));
		self
	}

	#[must_use]
	pub fn on_schedule_task(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, Task) -> Result<Task, Error>
			+ Send
			+ Sync
			+ 'static,
	) -> Self {
		self.schedule_task = Some(Arc::new(hook));
		self
	}

	/// Wraps every task execution, call [`Delegate::invoke_task`] to actually run the work.
	#[must_use]
	pub fn on_invoke_task(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, &Task) -> Result<(), WorkError>
			+ Send
			+ Sync
			+ 'static,
	) -> Self {
		self.invoke_task = Some(Arc::new(hook));
		self
	}

	#[must_use]
	pub fn on_cancel_task(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, &Task) -> Result<(), Error>
			+ Send
			+ Sync
			+ 'static,
	) -> Self {
		self.cancel_task = Some(Arc::new(hook));
		self
	}

	/// Returning `true` claims the error, `false` lets it propagate to the host.
	#[must_use]
	pub fn on_handle_error(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, &WorkError) -> bool + Send + Sync + 'static,
	) -> Self {
		self.handle_error = Some(Arc::new(hook));
		self
	}

	#[must_use]
	pub fn on_before_task(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, &Task) + Send + Sync + 'static,
	) -> Self {
		self.before_task = Some(Arc::new(hook));
		self
	}

	#[must_use]
	pub fn on_after_task(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, &Task) + Send + Sync + 'static,
	) -> Self {
		self.after_task = Some(Arc::new(hook));
		self
	}

	/// Notified when this context starts or stops having pending tasks of some kind.
	#[must_use]
	pub fn on_has_task(
		mut self,
		hook: impl Fn(&Delegate<'_>, &Context, &Context, HasTaskState) + Send + Sync + 'static,
	) -> Self {
		self.has_task = Some(Arc::new(hook));
		self
	}

	pub(crate) fn has_task_hook(&self) -> Option<HasTaskHook> {
		self.has_task.clone()
	}

	fn defined_hooks(&self) -> Vec<&'static str> {
		[
			("fork", self.fork.is_some()),
			("intercept", self.intercept.is_some()),
			("schedule_task", self.schedule_task.is_some()),
			("invoke_task", self.invoke_task.is_some()),
			("cancel_task", self.cancel_task.is_some()),
			("handle_error", self.handle_error.is_some()),
			("before_task", self.before_task.is_some()),
			("after_task", self.after_task.is_some()),
			("has_task", self.has_task.is_some()),
		]
		.into_iter()
		.filter_map(|(name, defined)| defined.then_some(name))
		.collect()
	}
}

impl fmt::Debug for Handler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handler")
			.field("hooks", &self.defined_hooks())
			.finish()
	}
}

/// Resolves hooks starting from a context and walking up through its ancestors.
///
/// A delegate without a starting context resolves nothing and always applies the default
/// behavior, which is what the root's handler receives as its parent delegate.
#[derive(Debug, Clone, Copy)]
pub struct Delegate<'ctx> {
	from: Option<&'ctx Context>,
}

impl<'ctx> Delegate<'ctx> {
	pub(crate) const fn new(from: Option<&'ctx Context>) -> Self {
		Self { from }
	}

	/// The context resolution starts from, if any.
	#[must_use]
	pub const fn context(&self) -> Option<&'ctx Context> {
		self.from
	}

	fn resolve<H: Clone>(
		&self,
		hook_name: &'static str,
		pick: fn(&Handler) -> Option<&H>,
	) -> Option<(&'ctx Context, H)> {
		let mut next = self.from;

		while let Some(context) = next {
			if let Some(hook) = context.handler().and_then(pick) {
				trace!(hook = hook_name, context = context.name(), "Resolved hook");
				return Some((context, hook.clone()));
			}
			next = context.parent();
		}

		None
	}

	pub fn fork(&self, target: &Context, spec: ContextSpec) -> Context {
		match self.resolve("fork", |handler| handler.fork.as_ref()) {
			Some((owner, hook)) => hook(&owner.parent_delegate(), owner, target, spec),
			None => Context::new_child(target, spec),
		}
	}

	pub fn intercept(&self, target: &Context, callback: Callback, source: &str) -> Callback {
		match self.resolve("intercept", |handler| handler.intercept.as_ref()) {
			Some((owner, hook)) => hook(&owner.parent_delegate(), owner, target, callback, source),
			None => callback,
		}
	}

	/// Without any hook the task's own schedule side effect runs.
	pub fn schedule_task(&self, target: &Context, task: Task) -> Result<Task, Error> {
		match self.resolve("schedule_task", |handler| handler.schedule_task.as_ref()) {
			Some((owner, hook)) => hook(&owner.parent_delegate(), owner, target, task),
			None => {
				task.run_schedule_fn()?;
				Ok(task)
			}
		}
	}

	/// Without any hook the task's work is invoked, panics included as [`WorkError::Panicked`].
	pub fn invoke_task(&self, target: &Context, task: &Task) -> Result<(), WorkError> {
		match self.resolve("invoke_task", |handler| handler.invoke_task.as_ref()) {
			Some((owner, hook)) => hook(&owner.parent_delegate(), owner, target, task),
			None => task.invoke_work(),
		}
	}

	/// Without any hook the task's own cancel side effect runs.
	pub fn cancel_task(&self, target: &Context, task: &Task) -> Result<(), Error> {
		match self.resolve("cancel_task", |handler| handler.cancel_task.as_ref()) {
			Some((owner, hook)) => hook(&owner.parent_delegate(), owner, target, task),
			None => {
				task.run_cancel_fn();
				Ok(())
			}
		}
	}

	/// `false` when nobody claimed the error.
	pub fn handle_error(&self, target: &Context, error: &WorkError) -> bool {
		self.resolve("handle_error", |handler| handler.handle_error.as_ref())
			.is_some_and(|(owner, hook)| hook(&owner.parent_delegate(), owner, target, error))
	}

	pub fn before_task(&self, target: &Context, task: &Task) {
		if let Some((owner, hook)) = self.resolve("before_task", |handler| handler.before_task.as_ref())
		{
			hook(&owner.parent_delegate(), owner, target, task);
		}
	}

	pub fn after_task(&self, target: &Context, task: &Task) {
		if let Some((owner, hook)) = self.resolve("after_task", |handler| handler.after_task.as_ref())
		{
			hook(&owner.parent_delegate(), owner, target, task);
		}
	}

	pub fn has_task(&self, target: &Context, state: HasTaskState) {
		if let Some((owner, hook)) = self.resolve("has_task", |handler| handler.has_task.as_ref()) {
			hook(&owner.parent_delegate(), owner, target, state);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::*;
	use crate::task::{TaskBuilder, TaskKind};

	#[test]
	fn nearest_ancestor_wins() {
		let calls = Arc::new(Mutex::new(Vec::new()));

		let outer = Context::root().fork(ContextSpec::new("outer").with_handler(
			Handler::new().on_before_task({
				let calls = Arc::clone(&calls);
				move |_, owner, _, _| calls.lock().unwrap().push(owner.name().to_string())
			}),
		));

		let inner = outer.fork(ContextSpec::new("inner").with_handler(
			Handler::new().on_before_task({
				let calls = Arc::clone(&calls);
				move |_, owner, _, _| calls.lock().unwrap().push(owner.name().to_string())
			}),
		));

		let leaf = inner.fork(ContextSpec::new("leaf"));
		let task = TaskBuilder::new(TaskKind::Macro, "test").build_in(&leaf);

		leaf.delegate().before_task(&leaf, &task);

		// Only the nearest definer runs, it didn't forward to its parent delegate
		assert_eq!(*calls.lock().unwrap(), vec!["inner".to_string()]);
	}

	#[test]
	fn hooks_can_forward_to_parent() {
		let seen = Arc::new(Mutex::new(Vec::new()));

		let outer = Context::root().fork(ContextSpec::new("outer").with_handler(
			Handler::new().on_handle_error({
				let seen = Arc::clone(&seen);
				move |_, owner, target, _| {
					seen.lock()
						.unwrap()
						.push((owner.name().to_string(), target.name().to_string()));
					true
				}
			}),
		));

		let inner = outer.fork(ContextSpec::new("inner").with_handler(
			Handler::new().on_handle_error({
				let seen = Arc::clone(&seen);
				move |parent, owner, target, error| {
					seen.lock()
						.unwrap()
						.push((owner.name().to_string(), target.name().to_string()));
					parent.handle_error(target, error)
				}
			}),
		));

		assert!(inner.handle_error(&WorkError::new("boom")));
		assert_eq!(
			*seen.lock().unwrap(),
			vec![
				("inner".to_string(), "inner".to_string()),
				("outer".to_string(), "inner".to_string())
			]
		);
	}

	#[test]
	fn defaults_apply_without_hooks() {
		let context = Context::root().fork(ContextSpec::new("plain"));

		assert!(!context.handle_error(&WorkError::new("boom")));

		let mut callback = context
			.delegate()
			.intercept(&context, Box::new(|| Ok(())), "test");
		assert!(callback().is_ok());

		let child = context
			.delegate()
			.fork(&context, ContextSpec::new("child"));
		assert_eq!(child.parent(), Some(&context));
	}

	#[test]
	fn debug_lists_defined_hooks() {
		let handler = Handler::new()
			.on_handle_error(|_, _, _, _| true)
			.on_after_task(|_, _, _, _| {});

		let debug = format!("{handler:?}");
		assert!(debug.contains("handle_error"));
		assert!(debug.contains("after_task"));
		assert!(!debug.contains("fork"));
	}
}
