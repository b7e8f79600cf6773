//! Scheduling boundaries. A [`Window`] decides how long a batch keeps
//! accumulating requests before it is drained and dispatched.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_timer::Delay;

/// Something that can open a batch window. `open` is called exactly once per
/// batch cycle, when the first request of the cycle is enqueued; the cycle is
/// drained as soon as the returned future completes.
///
/// Any `Fn() -> impl Future<Output = ()>` is a window, so ad-hoc windows can
/// be written as closures:
///
/// ```
/// use batcher::Window;
/// use futures::future;
///
/// fn assert_window(_: impl Window) {}
///
/// assert_window(|| future::ready(()));
/// ```
pub trait Window {
    type Boundary: Future<Output = ()>;

    fn open(&self) -> Self::Boundary;
}

impl<F, Fut> Window for F
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    type Boundary = Fut;

    fn open(&self) -> Fut {
        self()
    }
}

/// The default window. It stays open for exactly one scheduler turn: it
/// closes when the future that opened it is polled again after waking, so
/// every request issued in the meantime (including requests issued by other
/// futures polled later in the same turn) shares that batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextTick;

impl Window for NextTick {
    type Boundary = YieldNow;

    fn open(&self) -> YieldNow {
        YieldNow { yielded: false }
    }
}

/// A window that stays open for a fixed duration, measured from the first
/// request of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sleep(pub Duration);

impl Window for Sleep {
    type Boundary = Delay;

    fn open(&self) -> Delay {
        Delay::new(self.0)
    }
}

/// Future returned by [`NextTick`]. It is pending the first time it is
/// polled (after scheduling a wakeup), and ready after that.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
