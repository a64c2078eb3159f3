use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::time::{sleep, Instant, Sleep};

/// Byte stream that fails with `TimedOut` when no chunk arrives within the
/// limit. Each delivered chunk resets the deadline. The optional flag
/// records that the limit fired, so callers can tell an idle source apart
/// from other transport failures after the fact.
pub(crate) struct IdleTimeout<S> {
    inner: S,
    limit: Duration,
    sleep: Pin<Box<Sleep>>,
    expired: Option<Arc<AtomicBool>>,
}

impl<S> IdleTimeout<S> {
    pub(crate) fn new(inner: S, limit: Duration, expired: Option<Arc<AtomicBool>>) -> Self {
        Self {
            inner,
            limit,
            sleep: Box::pin(sleep(limit)),
            expired,
        }
    }
}

impl<S, E> Stream for IdleTimeout<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let deadline = Instant::now() + this.limit;
                this.sleep.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, err))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    if let Some(flag) = &this.expired {
                        flag.store(true, Ordering::SeqCst);
                    }
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "stream idle timeout",
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
