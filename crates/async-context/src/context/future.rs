use std::{
	future::Future,
	pin::Pin,
	task::{Context as PollCx, Poll},
};

use pin_project_lite::pin_project;
use tokio::task::JoinHandle;

use super::{current, Context, Frame};

pin_project! {
	/// Future adapter that enters a [`Context`] on every poll.
	///
	/// Async code resumes from whatever thread the executor picks, so the context active when the
	/// future was created must be entered again each time it gets polled.
	#[must_use = "futures do nothing unless you `.await` or poll them"]
	#[derive(Debug)]
	pub struct InContext<F> {
		context: Context,
		#[pin]
		inner: F,
	}
}

impl<F: Future> Future for InContext<F> {
	type Output = F::Output;

	fn poll(self: Pin<&mut Self>, cx: &mut PollCx<'_>) -> Poll<Self::Output> {
		let this = self.project();
		let _guard = current::enter(Frame::new(this.context.clone(), current::task()));

		this.inner.poll(cx)
	}
}

impl<F> InContext<F> {
	pub const fn context(&self) -> &Context {
		&self.context
	}
}

/// Binds futures to a [`Context`].
pub trait WithContext: Sized {
	fn in_context(self, context: &Context) -> InContext<Self> {
		InContext {
			context: context.clone(),
			inner: self,
		}
	}

	/// Binds to the context that is current right now, not when the future gets polled.
	fn in_current_context(self) -> InContext<Self> {
		self.in_context(&Context::current())
	}
}

impl<F: Future> WithContext for F {}

/// Spawns a future on the current tokio runtime, carrying the current [`Context`] along.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime, just like [`tokio::spawn`].
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_context())
}
