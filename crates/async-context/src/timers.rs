//! Timers scheduled through tasks, for code that wants its deferred work to keep the context
//! that was current when it got scheduled.

use std::{
	future::Future,
	panic::panic_any,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use futures::StreamExt;
use tokio::{
	runtime::Handle,
	task::{JoinError, JoinHandle},
	time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{trace, warn, Instrument};

use super::{
	error::{Error, WorkError},
	task::{Task, TaskBuilder, TaskKind, TaskState},
};

/// A timer scheduled by [`set_timeout`] or [`set_interval`].
#[derive(Debug)]
pub struct TimerHandle {
	task: Task,
	join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimerHandle {
	/// The macro task backing this timer.
	#[must_use]
	pub const fn task(&self) -> &Task {
		&self.task
	}

	/// Cancels the timer, a timer that already fired is left alone.
	pub fn cancel(&self) -> Result<(), Error> {
		self.task.cancel()
	}

	/// Waits for the timer to fire, or to be canceled.
	///
	/// Unclaimed errors raised by the timer's work come back as a panicked [`JoinError`].
	pub async fn join(self) -> Result<(), JoinError> {
		let maybe_handle = self
			.join
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		match maybe_handle {
			Some(handle) => match handle.await {
				Err(e) if e.is_cancelled() => Ok(()),
				res => res,
			},
			None => Ok(()),
		}
	}
}

/// Runs `work` once after `delay`, inside the current context.
///
/// Needs to be called from within a tokio runtime, otherwise [`Error::RuntimeUnavailable`].
pub fn set_timeout(
	delay: Duration,
	work: impl FnMut(&Task) -> Result<(), WorkError> + Send + 'static,
) -> Result<TimerHandle, Error> {
	schedule_timer(
		TaskBuilder::new(TaskKind::Macro, "setTimeout").work(work),
		move |task| async move {
			sleep(delay).await;
			resurface(&task, task.run());
		},
	)
}

/// Runs `work` every `period`, inside the current context, until canceled.
pub fn set_interval(
	period: Duration,
	work: impl FnMut(&Task) -> Result<(), WorkError> + Send + 'static,
) -> Result<TimerHandle, Error> {
	if period.is_zero() {
		return Err(Error::InvalidArgument(
			"interval period must be greater than zero".to_string(),
		));
	}

	schedule_timer(
		TaskBuilder::new(TaskKind::Macro, "setInterval")
			.periodic(true)
			.work(work),
		move |task| async move {
			let mut interval = interval_at(Instant::now() + period, period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

			let mut ticks = IntervalStream::new(interval);

			while ticks.next().await.is_some() {
				if task.state() == TaskState::NotScheduled || !resurface(&task, task.run()) {
					break;
				}
			}

			trace!(task_id = %task.id(), "Interval stopped");
		},
	)
}

fn schedule_timer<Fut>(
	builder: TaskBuilder,
	drive: impl FnOnce(Task) -> Fut,
) -> Result<TimerHandle, Error>
where
	Fut: Future<Output = ()> + Send + 'static,
{
	let runtime = Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;

	let join = Arc::new(Mutex::new(None::<JoinHandle<()>>));

	let task = builder
		.on_cancel({
			let join = Arc::clone(&join);
			move |task| {
				if let Some(handle) = join
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.as_ref()
				{
					trace!(task_id = %task.id(), "Aborting canceled timer");
					handle.abort();
				}
			}
		})
		.build()
		.schedule()?;

	let handle = runtime.spawn(drive(task.clone()).in_current_span());

	*join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

	Ok(TimerHandle { task, join })
}

/// `false` when the timer must stop. Unclaimed work errors are re-raised as a panic of the
/// tokio task, so they reach the runtime's own panic handling.
fn resurface(task: &Task, res: Result<(), Error>) -> bool {
	match res {
		Ok(()) => true,
		Err(Error::Unhandled(e)) => {
			// Nothing drives the task once the panic unwinds
			task.context().retire_task(task);
			panic_any(e)
		}
		Err(e) => {
			warn!(%e, "Timer task failed to run");
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn timers_need_a_runtime() {
		assert!(matches!(
			set_timeout(Duration::from_millis(1), |_| Ok(())),
			Err(Error::RuntimeUnavailable)
		));
	}

	#[tokio::test]
	async fn zero_period_is_rejected() {
		assert!(matches!(
			set_interval(Duration::ZERO, |_| Ok(())),
			Err(Error::InvalidArgument(_))
		));
	}
}
