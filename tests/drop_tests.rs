//! These tests ensure that dropped futures correctly update the shared state
use batcher::{BatchRules, Batcher, KeySet, Sleep, ValueSet};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{executor, future};
use std::{
    future::Future,
    hash::Hash,
    pin::Pin,
    rc::Rc,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// Testing async function: put a copy of each key in an Rc in the result.
/// This lets us count how many clones of each result are alive.
async fn put_keys_in_rc<T: Copy + Eq + Hash>(
    keys: KeySet<T>,
) -> Result<ValueSet<T, Rc<T>, ()>, ()> {
    Ok(keys.into_values(|key| Rc::new(*key)))
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let rules = BatchRules::new(put_keys_in_rc);
    let batcher = Batcher::new(&rules);

    let fut1 = batcher.run(1);
    let fut2 = batcher.run(1);
    let fut3 = batcher.run(1);
    let fut4 = batcher.run(1);

    let res1 = executor::block_on(fut1).unwrap().unwrap();

    // At this point, the shared result and our local fut1 result should both
    // have an Rc
    assert_eq!(Rc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the underlying Rc
    let res2 = executor::block_on(fut2).unwrap().unwrap();
    assert_eq!(Rc::strong_count(&res2), 3);

    // Dropping this future shouldn't change anything
    drop(fut3);
    assert_eq!(Rc::strong_count(&res1), 3);

    // However, dropping our last remaining handle to the state should cause
    // the shared state to be dropped
    drop(fut4);
    assert_eq!(Rc::strong_count(&res1), 2);
}

/// The last future to collect a duplicated result gets the original, rather
/// than a clone
#[test]
fn test_last_taker_moves() {
    let rules = BatchRules::new(put_keys_in_rc);
    let batcher = Batcher::new(&rules);

    let fut1 = batcher.run(1);
    let fut2 = batcher.run(1);

    let res1 = executor::block_on(fut1).unwrap().unwrap();
    assert_eq!(Rc::strong_count(&res1), 2);

    let res2 = executor::block_on(fut2).unwrap().unwrap();
    assert_eq!(Rc::strong_count(&res2), 2);
    assert!(Rc::ptr_eq(&res1, &res2));
}

#[test]
fn test_drop_during_window() {
    // This bulk fetch asserts that precisely the keys 1 and 2 are present in
    // the key set
    let rules = BatchRules::new(|keys: KeySet<i32>| async move {
        assert_eq!(keys.len(), 2);

        let keys_vec: Vec<&i32> = keys.keys().collect();
        assert!(keys_vec.contains(&&1));
        assert!(keys_vec.contains(&&2));

        if false {
            // Needed for the type annotation
            Err(())
        } else {
            Ok(keys.into_values(|key| *key))
        }
    })
    .with_window(Sleep(Duration::from_millis(10)));
    let batcher = Batcher::new(&rules);

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = batcher.run(1);
    let fut11 = batcher.run(1);
    let fut2 = batcher.run(2);
    let fut3 = batcher.run(3);

    // This poll initiates the window. We'll drop futures in this phase, then
    // confirm that the dropped keys weren't in the batched set.
    let poll = Pin::new(&mut fut1).poll(&mut ctx);
    assert_eq!(poll, Poll::Pending);

    drop(fut11);
    drop(fut3);

    let result = executor::block_on(fut1).unwrap();
    assert_eq!(result, Some(1));

    let result = executor::block_on(fut2).unwrap();
    assert_eq!(result, Some(2));
}

/// If every future of a cycle is dropped before the window closes, the bulk
/// fetch is never called, and the next request starts a fresh cycle.
#[test]
fn test_drop_entire_cycle() {
    let calls = Mutex::new(Vec::new());

    let rules = BatchRules::new(|keys: KeySet<i32>| {
        let mut recorded: Vec<i32> = keys.keys().copied().collect();
        recorded.sort();
        calls.lock().unwrap().push(recorded);

        future::ready(Ok::<_, ()>(keys.into_values(|key| *key)))
    });
    let batcher = Batcher::new(&rules);

    drop(batcher.run(1));
    drop(batcher.run(2));

    assert_eq!(executor::block_on(batcher.run(3)), Ok(Some(3)));
    assert_eq!(*calls.lock().unwrap(), [vec![3]]);
}

/// Dropping a future while its bulk fetch is running discards its interest
/// in the result, so the remaining requester gets the original value.
#[test]
fn test_drop_while_running() {
    let rules = BatchRules::new(|keys: KeySet<i32>| async move {
        let mut yielded = false;
        future::poll_fn(move |ctx| {
            if yielded {
                Poll::Ready(())
            } else {
                yielded = true;
                ctx.waker().wake_by_ref();
                Poll::Pending
            }
        })
        .await;

        Ok::<_, ()>(keys.into_values(|key| Rc::new(*key)))
    });
    let batcher = Batcher::new(&rules);

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = batcher.run(1);
    let fut2 = batcher.run(1);

    // Open the window, close it, and start the bulk fetch
    assert_eq!(Pin::new(&mut fut1).poll(&mut ctx), Poll::Pending);
    assert_eq!(Pin::new(&mut fut1).poll(&mut ctx), Poll::Pending);

    drop(fut2);

    let result = executor::block_on(fut1).unwrap().unwrap();
    assert_eq!(Rc::strong_count(&result), 1);
}
