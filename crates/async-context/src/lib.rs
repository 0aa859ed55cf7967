//!
//! # Async Context
//!
//! Spacedrive's Async Context is a library that carries an execution context across asynchronous
//! boundaries, and lets observers intercept every piece of deferred work scheduled inside it.
//!
//! A [`Context`] is a node in a tree, entered with [`Context::run`] and derived with
//! [`Context::fork`]. Deferred work is tracked by a [`Task`], bound for life to the context that
//! was current when it got created. Whoever later runs the task, its context is the current one
//! while it runs. Aside from that:
//! - Contexts carry a property bag, with lookups falling back to their ancestors;
//! - Each context may contribute a [`Handler`] with interception hooks, resolved from the nearest
//!   ancestor defining them, to wrap scheduling, invocation, cancellation and error handling;
//! - Errors raised by tasks flow back to `handle_error` hooks, the unclaimed ones always resurface;
//! - A [`NativeBridge`] mirrors the native async operations of a host runtime as tasks;
//! - Timers ([`set_timeout`], [`set_interval`]) and futures ([`WithContext`], [`spawn`]) keep their
//!   context on tokio;
//!
//!
//! ## Basic example
//!
//! ```
//! use std::sync::{
//!     atomic::{AtomicUsize, Ordering},
//!     Arc,
//! };
//!
//! use sd_async_context::{Context, ContextSpec, Handler, WorkError};
//!
//! let claimed = Arc::new(AtomicUsize::new(0));
//!
//! let context = Context::root().fork(
//!     ContextSpec::new("request")
//!         .with_property("user", "alice")
//!         .with_handler(Handler::new().on_handle_error({
//!             let claimed = Arc::clone(&claimed);
//!             move |_, _, _, _| {
//!                 claimed.fetch_add(1, Ordering::SeqCst);
//!                 true
//!             }
//!         })),
//! );
//!
//! let task = context
//!     .schedule_macro_task(
//!         "example",
//!         |_| {
//!             assert_eq!(Context::current().name(), "request");
//!             Err(WorkError::new("boom"))
//!         },
//!         None,
//!         None,
//!     )
//!     .unwrap();
//!
//! // Running from another context still runs inside "request", and the error gets claimed
//! Context::root().run(|| task.run()).unwrap();
//!
//! assert_eq!(claimed.load(Ordering::SeqCst), 1);
//! assert_eq!(context.get_as::<&str>("user").as_deref(), Some(&"alice"));
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod context;
mod delegate;
mod error;
mod flags;
mod native;
mod task;
mod timers;

pub use context::{
	spawn, BeforeRunStatus, Context, ContextId, ContextSpec, InContext, Property, WithContext,
};
pub use delegate::{
	Callback, CancelTaskHook, Delegate, ForkHook, HandleErrorHook, Handler, HasTaskHook,
	InterceptHook, InvokeTaskHook, ScheduleTaskHook, TaskHook,
};
pub use error::{Error, HostError, WorkError};
pub use flags::{
	apply_env_overrides, disable, enable, is_disabled, native_hooks_active, Flags, Patch,
};
pub use native::{probe_native_support, AsyncHooks, AsyncId, NativeBridge, NativeHost, NativeKind};
pub use task::{
	CancelFn, HasTaskState, ScheduleFn, Task, TaskBuilder, TaskCounts, TaskId, TaskKind, TaskState,
	Work,
};
pub use timers::{set_interval, set_timeout, TimerHandle};
