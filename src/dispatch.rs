//! Dispatching a drained queue: splitting it into sub-batches, running one
//! bulk fetch per sub-batch, and routing each result back to its request.

use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::{debug, trace};

use crate::{
    data::{KeySet, Token, ValueSet},
    error::LoadError,
    queue::{Queue, Ticket},
};

/// Where a request's result will come from: which sub-batch, and which key
/// within that sub-batch.
#[derive(Debug)]
struct Route {
    batch: usize,
    token: Token,
}

enum SubBatch<Key, Value, Error, Fut> {
    /// The bulk fetch is in flight. Requests dropped in the meantime are
    /// remembered so they can be discarded from its ValueSet.
    Running {
        fut: Pin<Box<Fut>>,
        dropped: Vec<Token>,
    },

    Done(Result<ValueSet<Key, Value, Error>, Error>),
}

/// Split the live requests of a drained queue into consecutive sub-batches
/// of at most `max_batch_size` requests, deduplicating keys within each
/// sub-batch. Returns the key sets along with a route for every ticket that
/// is still live.
fn partition<Key: Eq + Hash>(
    queue: Queue<Key>,
    max_batch_size: Option<NonZeroUsize>,
) -> (Vec<KeySet<Key>>, Vec<Option<Route>>) {
    let mut routes = Vec::new();
    routes.resize_with(queue.tickets(), || None);

    let mut batches: Vec<KeySet<Key>> = Vec::new();
    let mut filled = 0;

    for (ticket, key) in queue.into_requests() {
        let full = match max_batch_size {
            Some(max) => filled >= max.get(),
            None => false,
        };

        if batches.is_empty() || full {
            batches.push(KeySet::new());
            filled = 0;
        }

        let batch = batches.len() - 1;
        let token = batches[batch].add_key(key);
        filled += 1;
        routes[ticket.index()] = Some(Route { batch, token });
    }

    (batches, routes)
}

/// The running half of a batch cycle. Created when the cycle's window
/// closes; from then on it owns every request that was queued in the cycle.
pub(crate) struct Dispatch<Key, Value, Error, Fut> {
    batches: Vec<SubBatch<Key, Value, Error, Fut>>,
    routes: Vec<Option<Route>>,
    running: usize,
}

impl<Key, Value, Error, Fut> Dispatch<Key, Value, Error, Fut>
where
    Key: Eq + Hash,
    Fut: Future<Output = Result<ValueSet<Key, Value, Error>, Error>>,
{
    /// Drain `queue`, invoking `fetch` once for each sub-batch.
    pub(crate) fn start<Fetch>(
        queue: Queue<Key>,
        max_batch_size: Option<NonZeroUsize>,
        fetch: &Fetch,
    ) -> Self
    where
        Fetch: Fn(KeySet<Key>) -> Fut,
    {
        if queue.is_empty() {
            trace!("every request in the batch was dropped before dispatch");
        }

        let requests = queue.len();
        let (keysets, routes) = partition(queue, max_batch_size);

        debug!(requests, batches = keysets.len(), "dispatching batch");

        let batches: Vec<_> = keysets
            .into_iter()
            .enumerate()
            .map(|(index, keys)| {
                trace!(batch = index, keys = keys.len(), "invoking bulk fetch");

                SubBatch::Running {
                    fut: Box::pin(fetch(keys)),
                    dropped: Vec::new(),
                }
            })
            .collect();

        Self {
            running: batches.len(),
            batches,
            routes,
        }
    }

    /// Poll every bulk fetch that's still in flight. Returns the number of
    /// sub-batches that completed during this call.
    pub(crate) fn poll_batches(&mut self, ctx: &mut Context<'_>) -> usize {
        let mut finished = 0;

        for (index, batch) in self.batches.iter_mut().enumerate() {
            if let SubBatch::Running { fut, dropped } = batch {
                if let Poll::Ready(mut result) = fut.as_mut().poll(ctx) {
                    match result {
                        // Some futures may have lost interest while the fetch
                        // was running. Remove those tokens from the ValueSet.
                        Ok(ref mut values) => {
                            dropped.drain(..).for_each(|token| values.discard(token));
                            trace!(batch = index, "bulk fetch complete");
                        }
                        Err(..) => debug!(
                            batch = index,
                            "bulk fetch failed; rejecting every request in the batch"
                        ),
                    }

                    *batch = SubBatch::Done(result);
                    finished += 1;
                }
            }
        }

        self.running -= finished;
        finished
    }
}

impl<Key, Value, Error, Fut> Dispatch<Key, Value, Error, Fut> {
    /// True once every bulk fetch has completed.
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.running == 0
    }

    /// A request is no longer interested in its result.
    pub(crate) fn discard(&mut self, ticket: Ticket) {
        let route = match self.routes.get_mut(ticket.index()).and_then(Option::take) {
            Some(route) => route,
            None => return,
        };

        match &mut self.batches[route.batch] {
            SubBatch::Running { dropped, .. } => dropped.push(route.token),
            SubBatch::Done(Ok(values)) => values.discard(route.token),
            SubBatch::Done(Err(..)) => {}
        }
    }
}

impl<Key, Value: Clone, Error: Clone, Fut> Dispatch<Key, Value, Error, Fut> {
    /// Get the result for a request, if its sub-batch has finished. Each
    /// ticket can be settled only once.
    pub(crate) fn settle(&mut self, ticket: Ticket) -> Poll<Result<Option<Value>, LoadError<Error>>> {
        let batch = match self.routes.get(ticket.index()) {
            Some(Some(route)) => route.batch,
            _ => panic!("Unknown logic error: request has no route in its batch"),
        };

        if let SubBatch::Running { .. } = self.batches[batch] {
            return Poll::Pending;
        }

        let token = match self.routes[ticket.index()].take() {
            Some(route) => route.token,
            None => unreachable!(),
        };

        Poll::Ready(match &mut self.batches[batch] {
            SubBatch::Done(Ok(values)) => match values.take(token) {
                None => panic!("Unknown logic error: no entry in ValueSet associated with Token"),
                Some(None) => Ok(None),
                Some(Some(Ok(value))) => Ok(Some(value)),
                Some(Some(Err(err))) => Err(LoadError::Key(err)),
            },
            SubBatch::Done(Err(err)) => Err(LoadError::Batch(err.clone())),
            SubBatch::Running { .. } => unreachable!(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{self, Ready};
    use futures::task::noop_waker_ref;
    use std::cell::RefCell;

    type Fetched = Result<ValueSet<&'static str, usize, String>, String>;

    fn queue_of(keys: &[&'static str]) -> (Queue<&'static str>, Vec<Ticket>) {
        let mut queue = Queue::default();
        let tickets = keys.iter().map(|&key| queue.push(key)).collect();
        (queue, tickets)
    }

    fn sorted_keys(keys: &KeySet<&'static str>) -> Vec<&'static str> {
        let mut keys: Vec<_> = keys.keys().copied().collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_partition_by_request_count() {
        let (queue, _tickets) = queue_of(&["a", "b", "a", "c", "d"]);
        let (batches, routes) = partition(queue, NonZeroUsize::new(2));

        let keys: Vec<_> = batches.iter().map(sorted_keys).collect();
        assert_eq!(keys, [vec!["a", "b"], vec!["a", "c"], vec!["d"]]);

        let assigned: Vec<_> = routes
            .iter()
            .map(|route| route.as_ref().unwrap().batch)
            .collect();
        assert_eq!(assigned, [0, 0, 1, 1, 2]);
    }

    #[test]
    fn test_partition_unbounded_dedups() {
        let (queue, _tickets) = queue_of(&["a", "b", "a", "a"]);
        let (batches, _routes) = partition(queue, None);

        assert_eq!(batches.len(), 1);
        assert_eq!(sorted_keys(&batches[0]), ["a", "b"]);
    }

    #[test]
    fn test_partition_skips_cancelled() {
        let (mut queue, tickets) = queue_of(&["a", "b", "c"]);
        queue.cancel(tickets[1]);

        let (batches, routes) = partition(queue, NonZeroUsize::new(1));
        assert_eq!(batches.len(), 2);
        assert!(routes[1].is_none());
        assert_eq!(routes[2].as_ref().unwrap().batch, 1);
    }

    #[test]
    fn test_dispatch_routes_results() {
        let calls = RefCell::new(0);
        let fetch = |keys: KeySet<&'static str>| -> Ready<Fetched> {
            *calls.borrow_mut() += 1;
            future::ready(Ok(keys.into_results(|key| match *key {
                "bad" => Err("bad key".to_owned()),
                key => Ok(key.len()),
            })))
        };

        let (queue, tickets) = queue_of(&["one", "three", "bad", "one"]);
        let mut dispatch = Dispatch::start(queue, None, &fetch);
        assert_eq!(*calls.borrow(), 1);
        assert!(!dispatch.is_done());

        let mut ctx = Context::from_waker(noop_waker_ref());
        assert_eq!(dispatch.poll_batches(&mut ctx), 1);
        assert!(dispatch.is_done());

        assert_eq!(dispatch.settle(tickets[0]), Poll::Ready(Ok(Some(3))));
        assert_eq!(dispatch.settle(tickets[1]), Poll::Ready(Ok(Some(5))));
        assert_eq!(
            dispatch.settle(tickets[2]),
            Poll::Ready(Err(LoadError::Key("bad key".to_owned())))
        );
        assert_eq!(dispatch.settle(tickets[3]), Poll::Ready(Ok(Some(3))));
    }

    #[test]
    fn test_dispatch_failure_is_per_batch() {
        let fetch = |keys: KeySet<&'static str>| -> Ready<Fetched> {
            if keys.keys().any(|key| *key == "a") {
                future::ready(Err("shard down".to_owned()))
            } else {
                future::ready(Ok(keys.into_values(|key| key.len())))
            }
        };

        let (queue, tickets) = queue_of(&["a", "b", "cc"]);
        let mut dispatch = Dispatch::start(queue, NonZeroUsize::new(2), &fetch);

        let mut ctx = Context::from_waker(noop_waker_ref());
        assert_eq!(dispatch.poll_batches(&mut ctx), 2);

        let failure = Poll::Ready(Err(LoadError::Batch("shard down".to_owned())));
        assert_eq!(dispatch.settle(tickets[0]), failure);
        assert_eq!(dispatch.settle(tickets[1]), failure);
        assert_eq!(dispatch.settle(tickets[2]), Poll::Ready(Ok(Some(2))));
    }

    #[test]
    fn test_settle_waits_for_own_batch() {
        let fetch = |keys: KeySet<&'static str>| {
            let pending = keys.keys().any(|key| *key == "slow");
            async move {
                if pending {
                    future::pending::<()>().await;
                }
                Ok::<_, String>(keys.into_values(|key| key.len()))
            }
        };

        let (queue, tickets) = queue_of(&["slow", "fast"]);
        let mut dispatch = Dispatch::start(queue, NonZeroUsize::new(1), &fetch);

        let mut ctx = Context::from_waker(noop_waker_ref());
        assert_eq!(dispatch.poll_batches(&mut ctx), 1);
        assert!(!dispatch.is_done());

        assert_eq!(dispatch.settle(tickets[0]), Poll::Pending);
        assert_eq!(dispatch.settle(tickets[1]), Poll::Ready(Ok(Some(4))));
    }

    #[test]
    fn test_missing_key_resolves_to_none() {
        let fetch = |keys: KeySet<&'static str>| -> Ready<Fetched> {
            let mut values = keys.into_value_set();
            values.resolve("present", 1).unwrap();
            future::ready(Ok(values))
        };

        let (queue, tickets) = queue_of(&["present", "absent"]);
        let mut dispatch = Dispatch::start(queue, None, &fetch);
        dispatch.poll_batches(&mut Context::from_waker(noop_waker_ref()));

        assert_eq!(dispatch.settle(tickets[0]), Poll::Ready(Ok(Some(1))));
        assert_eq!(dispatch.settle(tickets[1]), Poll::Ready(Ok(None)));
    }
}
