use std::{
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::Mutex,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use tracing::trace;

use crate::{
    config::BatchOptions,
    data::{KeySet, ValueSet},
    dispatch::Dispatch,
    error::LoadError,
    queue::{Queue, Ticket},
    wakerset::{Token as WakerToken, WakerSet},
    window::{NextTick, Window},
};

struct AccumulatingState<'a, Key, Fetch, Boundary> {
    queue: Queue<Key>,
    fetch: &'a Fetch,
    max_batch_size: Option<NonZeroUsize>,
    boundary: Pin<Box<Boundary>>,
    wakers: WakerSet,
}

struct RunningState<Key, Value, Error, Fut> {
    dispatch: Dispatch<Key, Value, Error, Fut>,
    wakers: WakerSet,
}

impl<Key, Value, Error, Fut> RunningState<Key, Value, Error, Fut> {
    /// A future is done with the shared state. If there's still work in
    /// flight, make sure someone else is driving it.
    fn release(&mut self, token: WakerToken) {
        if self.dispatch.is_done() {
            self.wakers.discard_waker(token)
        } else {
            self.wakers.discard_and_wake(token)
        }
    }
}

enum State<'a, Key, Value, Error, Fut, Fetch, Boundary> {
    Accum(AccumulatingState<'a, Key, Fetch, Boundary>),
    Running(RunningState<Key, Value, Error, Fut>),
}

/// The rules for a [`Batcher`]: the bulk fetch function, the window during
/// which requests are coalesced, and the maximum number of requests sent to
/// a single bulk fetch.
#[derive(Debug, Clone)]
pub struct BatchRules<Fetch, Win = NextTick> {
    pub batcher: Fetch,
    pub window: Win,
    pub max_batch_size: Option<NonZeroUsize>,
}

impl<Fetch> BatchRules<Fetch> {
    /// Rules with the default options: a [`NextTick`] window, and at most 128
    /// requests per bulk fetch.
    pub fn new(batcher: Fetch) -> Self {
        Self::with_options(batcher, BatchOptions::default())
    }

    pub fn with_options(batcher: Fetch, options: BatchOptions) -> Self {
        Self {
            batcher,
            window: NextTick,
            max_batch_size: options.batch_limit(),
        }
    }
}

impl<Fetch, Win> BatchRules<Fetch, Win> {
    /// Replace the window of these rules.
    pub fn with_window<W: Window>(self, window: W) -> BatchRules<Fetch, W> {
        BatchRules {
            batcher: self.batcher,
            window,
            max_batch_size: self.max_batch_size,
        }
    }
}

/// The entry point for batched requests. See the [crate docs][crate] for an
/// overview.
pub struct Batcher<'a, Key, Value, Error, Fut, Fetch, Win: Window> {
    rules: &'a BatchRules<Fetch, Win>,

    // The cycle that's currently accumulating requests, if any. Once a cycle
    // is drained it's owned entirely by its futures; the Batcher only ever
    // holds a weak reference to it.
    #[allow(clippy::type_complexity)]
    state: Mutex<Weak<Mutex<State<'a, Key, Value, Error, Fut, Fetch, Win::Boundary>>>>,
}

impl<'a, Key, Value, Error, Fut, Fetch, Win> Batcher<'a, Key, Value, Error, Fut, Fetch, Win>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Win: Window,
    Fetch: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Key, Value, Error>, Error>>,
{
    pub fn new(rules: &'a BatchRules<Fetch, Win>) -> Self {
        Self {
            rules,
            state: Mutex::new(Weak::new()),
        }
    }

    /// Request the value for a single key. Every request made before the
    /// current cycle's window closes is sent in the same bulk fetch (or the
    /// same group of bulk fetches, if the cycle exceeds the max batch size).
    ///
    /// The returned future resolves to `Ok(None)` if the bulk fetch didn't
    /// return anything for this key.
    pub fn run(&self, key: Key) -> BatchFuture<'a, Key, Value, Error, Fut, Fetch, Win::Boundary> {
        let mut guard = self.state.lock().unwrap();

        // If there is an existing state, and it's still in the accum state,
        // add a new request to it. Note that at no point do we check the
        // window; we assume that if it has closed, a future poll will advance
        // the state to Running.
        if let Some(state_handle) = guard.upgrade() {
            let mut state_guard = state_handle.lock().unwrap();

            if let State::Accum(ref mut state) = *state_guard {
                let ticket = state.queue.push(key);
                drop(state_guard);

                return BatchFuture {
                    ticket,
                    waker_token: None,
                    state: Some(state_handle),
                };
            }
        }

        // Idle; this request opens a new cycle, and with it, exactly one
        // window.
        trace!("opening batch window");

        let mut queue = Queue::default();
        let ticket = queue.push(key);

        let state = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            queue,
            fetch: &self.rules.batcher,
            max_batch_size: self.rules.max_batch_size,
            boundary: Box::pin(self.rules.window.open()),
            wakers: WakerSet::default(),
        })));

        *guard = Arc::downgrade(&state);

        BatchFuture {
            ticket,
            waker_token: None,
            state: Some(state),
        }
    }
}

/// A request for the value associated with a single key, created by
/// [`Batcher::run`]. It shares its cycle with every other request made in the
/// same window; polling any of them drives the shared work.
#[must_use = "futures do nothing unless polled"]
pub struct BatchFuture<'a, Key, Value, Error, Fut, Fetch, Boundary> {
    ticket: Ticket,
    waker_token: Option<WakerToken>,

    #[allow(clippy::type_complexity)]
    state: Option<Arc<Mutex<State<'a, Key, Value, Error, Fut, Fetch, Boundary>>>>,
}

impl<'a, Key, Value, Error, Fut, Fetch, Boundary> Future
    for BatchFuture<'a, Key, Value, Error, Fut, Fetch, Boundary>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Boundary: Future<Output = ()>,
    Fetch: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Key, Value, Error>, Error>>,
{
    type Output = Result<Option<Value>, LoadError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        // Note about this mutex: it's safe to use this in an async context,
        // because the lock is released when poll returns.
        let mut guard = unpinned
            .state
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture")
            .lock()
            // If a *different* call to poll panicked while driving the
            // window or a bulk fetch, the mutex will be poisoned, which
            // ensures that other polls also panic.
            .unwrap();

        if let State::Accum(ref mut state) = *guard {
            // Only the driving future polls the window. Everyone else waits
            // to be woken, so that a window which closes "on the next poll"
            // isn't closed early by a sibling polled later in the same turn.
            if !state.wakers.may_drive(unpinned.waker_token.as_ref()) {
                state.wakers.park(&mut unpinned.waker_token, ctx.waker());
                return Poll::Pending;
            }

            if state.boundary.as_mut().poll(ctx).is_pending() {
                // This waker is now the driving waker for the window.
                state.wakers.register(&mut unpinned.waker_token, ctx.waker());
                return Poll::Pending;
            }

            // The window has closed. Swap out the queue and dispatch it; from
            // here on, new requests on the Batcher open a new cycle.
            let queue = state.queue.take();
            let wakers = mem::take(&mut state.wakers);
            let dispatch = Dispatch::start(queue, state.max_batch_size, state.fetch);

            *guard = State::Running(RunningState { dispatch, wakers });
        }

        let result = match *guard {
            State::Running(ref mut state) => {
                // If our result is already available, leave the bulk fetches
                // alone; they keep waking whichever future is driving them.
                let settled = match state.dispatch.settle(unpinned.ticket) {
                    Poll::Ready(result) => Poll::Ready(result),
                    Poll::Pending => {
                        // Polling the fetches moves their wakeups to this
                        // task, so it becomes the driver.
                        let finished = state.dispatch.poll_batches(ctx);
                        state.wakers.register(&mut unpinned.waker_token, ctx.waker());

                        if finished > 0 {
                            // Some sub-batches have results; wake everyone so
                            // those futures can collect them.
                            state.wakers.wake_others(unpinned.waker_token.as_ref());
                        }

                        state.dispatch.settle(unpinned.ticket)
                    }
                };

                match settled {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(result) => {
                        if let Some(token) = unpinned.waker_token.take() {
                            state.release(token);
                        }
                        result
                    }
                }
            }
            State::Accum(..) => unreachable!("BatchFuture contained invalid state"),
        };

        drop(guard);
        unpinned.state = None;
        Poll::Ready(result)
    }
}

impl<'a, Key, Value, Error, Fut, Fetch, Boundary> Drop
    for BatchFuture<'a, Key, Value, Error, Fut, Fetch, Boundary>
{
    fn drop(&mut self) {
        // The shared cycle is only ever driven by a single task, so if we
        // were the driver, another task has to be awoken to take over. That
        // logic is handled by the WakerSet.
        //
        // We don't do any cleanup if the mutex is poisoned; this crate
        // requires panic=abort, so that shouldn't be possible.
        if let Some(state) = self.state.as_ref() {
            if let Ok(mut guard) = state.lock() {
                match *guard {
                    State::Accum(ref mut state) => {
                        if let Some(waker_token) = self.waker_token.take() {
                            state.wakers.discard_and_wake(waker_token);
                        }

                        // Our key hasn't been sent anywhere yet; just take
                        // it out of the queue.
                        state.queue.cancel(self.ticket);
                    }
                    State::Running(ref mut state) => {
                        if let Some(waker_token) = self.waker_token.take() {
                            state.release(waker_token);
                        }

                        state.dispatch.discard(self.ticket);
                    }
                }
            }
        }
    }
}
