use sd_async_context::{
	set_interval, set_timeout, spawn, Context, ContextSpec, Handler, TaskState, WithContext,
	WorkError,
};

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use tokio::time::sleep;
use tracing_test::traced_test;

mod common;

use common::{events, recording_handler, take};

#[tokio::test(start_paused = true)]
#[traced_test]
async fn timeout_runs_in_its_scheduling_context() {
	let context = Context::root().fork(ContextSpec::new("timeout"));
	let seen = Arc::new(Mutex::new(None));

	let handle = context
		.run(|| {
			set_timeout(Duration::from_millis(100), {
				let seen = Arc::clone(&seen);
				move |task| {
					*seen.lock().unwrap() = Some((Context::current(), task.source().to_string()));
					Ok(())
				}
			})
		})
		.unwrap();

	assert_eq!(handle.task().context(), &context);
	assert_eq!(handle.task().state(), TaskState::Scheduled);
	assert_eq!(context.task_counts().macro_tasks, 1);

	let task = handle.task().clone();
	handle.join().await.unwrap();

	assert_eq!(
		seen.lock().unwrap().take(),
		Some((context.clone(), "setTimeout".to_string()))
	);
	assert_eq!(task.state(), TaskState::NotScheduled);
	assert_eq!(context.task_counts().macro_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn canceled_timeout_never_fires() {
	let events = events();
	let runs = Arc::new(AtomicUsize::new(0));

	let context =
		Context::root().fork(ContextSpec::new("canceled").with_handler(recording_handler(&events)));

	let handle = context
		.run(|| {
			set_timeout(Duration::from_secs(5), {
				let runs = Arc::clone(&runs);
				move |_| {
					runs.fetch_add(1, Ordering::SeqCst);
					Ok(())
				}
			})
		})
		.unwrap();

	sleep(Duration::from_secs(1)).await;
	handle.cancel().unwrap();
	// Canceling twice is fine
	handle.cancel().unwrap();

	let task = handle.task().clone();
	handle.join().await.unwrap();
	sleep(Duration::from_secs(10)).await;

	assert_eq!(runs.load(Ordering::SeqCst), 0);
	assert_eq!(task.state(), TaskState::NotScheduled);
	assert_eq!(take(&events), ["cancel:setTimeout"]);
}

#[tokio::test(start_paused = true)]
async fn interval_fires_until_canceled() {
	let events = events();
	let runs = Arc::new(AtomicUsize::new(0));

	let context =
		Context::root().fork(ContextSpec::new("interval").with_handler(recording_handler(&events)));

	let handle = context
		.run(|| {
			set_interval(Duration::from_millis(10), {
				let runs = Arc::clone(&runs);
				move |task| {
					assert_eq!(task.state(), TaskState::Running);
					runs.fetch_add(1, Ordering::SeqCst);
					Ok(())
				}
			})
		})
		.unwrap();

	assert!(handle.task().is_periodic());

	sleep(Duration::from_millis(35)).await;

	assert_eq!(runs.load(Ordering::SeqCst), 3);
	assert_eq!(handle.task().state(), TaskState::Scheduled);

	handle.cancel().unwrap();
	let task = handle.task().clone();
	handle.join().await.unwrap();

	sleep(Duration::from_millis(100)).await;

	assert_eq!(runs.load(Ordering::SeqCst), 3);
	assert_eq!(task.state(), TaskState::NotScheduled);
	assert_eq!(context.task_counts().macro_tasks, 0);
	assert_eq!(
		take(&events).last().map(String::as_str),
		Some("cancel:setInterval")
	);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn unclaimed_timer_errors_resurface_as_panics() {
	let context = Context::root().fork(ContextSpec::new("failing"));

	let handle = context
		.run(|| set_timeout(Duration::from_millis(1), |_| Err(WorkError::new("timer failed"))))
		.unwrap();

	let err = handle.join().await.unwrap_err();
	assert!(err.is_panic());

	let payload = err.into_panic();
	let work_error = payload.downcast_ref::<WorkError>().unwrap();
	assert_eq!(work_error.to_string(), "timer failed");
	assert!(logs_contain("Unhandled error on task work"));
}

#[tokio::test(start_paused = true)]
async fn unclaimed_interval_errors_take_the_interval_out() {
	let states = Arc::new(Mutex::new(Vec::new()));

	let context = Context::root().fork(ContextSpec::new("failing interval").with_handler(
		Handler::new().on_has_task({
			let states = Arc::clone(&states);
			move |_, _, _, state| states.lock().unwrap().push(state.macro_task)
		}),
	));

	let handle = context
		.run(|| set_interval(Duration::from_millis(10), |_| Err(WorkError::new("tick failed"))))
		.unwrap();

	let task = handle.task().clone();

	let err = handle.join().await.unwrap_err();
	assert!(err.is_panic());

	assert_eq!(task.state(), TaskState::NotScheduled);
	assert_eq!(task.run_count(), 0);
	assert_eq!(context.task_counts().macro_tasks, 0);
	assert_eq!(*states.lock().unwrap(), [true, false]);
}

#[tokio::test(start_paused = true)]
async fn claimed_timer_errors_stay_quiet() {
	let claimed = Arc::new(AtomicUsize::new(0));

	let context = Context::root().fork(ContextSpec::new("claiming").with_handler(
		Handler::new().on_handle_error({
			let claimed = Arc::clone(&claimed);
			move |_, _, _, _| {
				claimed.fetch_add(1, Ordering::SeqCst);
				true
			}
		}),
	));

	let handle = context
		.run(|| set_timeout(Duration::from_millis(1), |_| Err(WorkError::new("claimed"))))
		.unwrap();

	handle.join().await.unwrap();
	assert_eq!(claimed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn futures_keep_their_context_across_awaits() {
	let context = Context::root().fork(ContextSpec::new("future"));

	let seen = async {
		let before = Context::current();
		tokio::task::yield_now().await;
		let after = Context::current();
		(before, after)
	}
	.in_context(&context)
	.await;

	assert_eq!(seen, (context.clone(), context.clone()));
	assert_eq!(Context::current(), Context::root());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_futures_carry_the_current_context() {
	let context = Context::root().fork(ContextSpec::new("spawned"));

	let handle = context.run(|| {
		spawn(async {
			tokio::task::yield_now().await;
			Context::current()
		})
	});

	assert_eq!(handle.await.unwrap(), context);

	// Binding happens when the adapter is created, not when it's polled
	let bound = context.run(|| async { Context::current() }.in_current_context());
	assert_eq!(bound.context(), &context);
	assert_eq!(bound.await, context);
}
