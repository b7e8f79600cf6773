use std::mem;

/// The position of a request in its cycle's queue. Tickets are handed out in
/// insertion order and never reused within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Ticket(usize);

impl Ticket {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// The requests accumulated during a single batch cycle, in the order they
/// were made. A cancelled request leaves a hole rather than shifting the
/// requests after it, so outstanding tickets stay valid until the queue is
/// drained.
#[derive(Debug)]
pub(crate) struct Queue<Key> {
    slots: Vec<Option<Key>>,
    live: usize,
}

impl<Key> Default for Queue<Key> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }
}

impl<Key> Queue<Key> {
    pub(crate) fn push(&mut self, key: Key) -> Ticket {
        let ticket = Ticket(self.slots.len());
        self.slots.push(Some(key));
        self.live += 1;
        ticket
    }

    /// Remove a request from the queue; its key won't be fetched on its
    /// behalf. No-op if it was already cancelled.
    pub(crate) fn cancel(&mut self, ticket: Ticket) {
        if let Some(slot) = self.slots.get_mut(ticket.index()) {
            if slot.take().is_some() {
                self.live -= 1;
            }
        }
    }

    /// The number of requests which haven't been cancelled
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// The number of tickets handed out, including cancelled ones
    #[inline]
    pub(crate) fn tickets(&self) -> usize {
        self.slots.len()
    }

    /// Take the queue out of this particular &mut self instance, replacing it
    /// with an empty one. Used when the cycle is drained.
    pub(crate) fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Consume the queue, yielding the live requests in insertion order.
    pub(crate) fn into_requests(self) -> impl Iterator<Item = (Ticket, Key)> {
        self.slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, key)| key.map(|key| (Ticket(index), key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_leaves_hole() {
        let mut queue = Queue::default();
        let a = queue.push("a");
        let b = queue.push("b");
        let c = queue.push("c");

        queue.cancel(b);
        queue.cancel(b);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.tickets(), 3);

        let requests: Vec<_> = queue.into_requests().collect();
        assert_eq!(requests, [(a, "a"), (c, "c")]);
    }

    #[test]
    fn test_take_resets() {
        let mut queue = Queue::default();
        queue.push(1);

        let drained = queue.take();
        assert!(queue.is_empty());
        assert_eq!(queue.tickets(), 0);
        assert_eq!(drained.len(), 1);

        // A fresh queue hands out tickets from the start again
        assert_eq!(queue.push(2).index(), 0);
    }
}
