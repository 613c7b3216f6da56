//! Progress deadlines for client connections.
//!
//! hyper's http1 builder only bounds header reads, so a client that dribbles
//! a request body or drains its response one byte at a time would otherwise
//! hold its connection (and its listener semaphore slot) forever. This
//! wrapper puts progress deadlines on the underlying stream: a poll that
//! makes no progress past its deadline fails the connection with
//! `TimedOut`. The write deadline re-arms only on written bytes; the read
//! deadline re-arms on progress in either direction, so it acts as the
//! idle bound without cutting off a client that is quietly draining a long
//! response.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

pub struct TimedStream<S> {
	inner: S,
	read_timeout: Duration,
	read_deadline: Pin<Box<Sleep>>,
	write_timeout: Duration,
	write_deadline: Pin<Box<Sleep>>,
}

impl<S> TimedStream<S> {
	pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> TimedStream<S> {
		TimedStream {
			inner,
			read_timeout,
			read_deadline: Box::pin(tokio::time::sleep(read_timeout)),
			write_timeout,
			write_deadline: Box::pin(tokio::time::sleep(write_timeout)),
		}
	}
}

fn timed_out(direction: &str) -> io::Error {
	io::Error::new(
		io::ErrorKind::TimedOut,
		format!("{direction} made no progress"),
	)
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_read(cx, buf) {
			Poll::Ready(result) => {
				this
					.read_deadline
					.as_mut()
					.reset(Instant::now() + this.read_timeout);
				Poll::Ready(result)
			},
			Poll::Pending => {
				if this.read_deadline.as_mut().poll(cx).is_ready() {
					return Poll::Ready(Err(timed_out("read")));
				}
				Poll::Pending
			},
		}
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_write(cx, buf) {
			Poll::Ready(result) => {
				let now = Instant::now();
				this.write_deadline.as_mut().reset(now + this.write_timeout);
				// Write progress keeps the connection non-idle.
				this.read_deadline.as_mut().reset(now + this.read_timeout);
				Poll::Ready(result)
			},
			Poll::Pending => {
				if this.write_deadline.as_mut().poll(cx).is_ready() {
					return Poll::Ready(Err(timed_out("write")));
				}
				Poll::Pending
			},
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_flush(cx) {
			Poll::Ready(result) => {
				let now = Instant::now();
				this.write_deadline.as_mut().reset(now + this.write_timeout);
				this.read_deadline.as_mut().reset(now + this.read_timeout);
				Poll::Ready(result)
			},
			Poll::Pending => {
				if this.write_deadline.as_mut().poll(cx).is_ready() {
					return Poll::Ready(Err(timed_out("write")));
				}
				Poll::Pending
			},
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}
