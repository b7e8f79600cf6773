use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared batch cycle. In particular, it is designed so that only
/// a single task needs to actually do the work of driving the window and the
/// bulk fetches to completion, but other tasks can take its place if that one
/// is dropped or finishes early.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a running future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan are correctly associated with a particular task.
///
/// The WakerSet maintains the notion of the "driving waker"; this is the
/// waker that most recently polled the shared work. If the driving waker is
/// discarded from the set, another is selected as the driving waker and
/// awoken. So long as futures take care to discard their stored tokens when
/// they are dropped or complete, the shared cycle always has a path forward.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::new(1).unwrap(),
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Record the waker that was just used to poll the shared work, making it
    /// the driving waker. If the future doesn't have a token yet, one is
    /// created and stored in `slot`.
    pub(crate) fn register(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        self.park(slot, waker);

        if let Some(token) = slot {
            self.driving_waker = Some(token.duplicate());
        }
    }

    /// Record the waker of a future that is waiting on the shared work
    /// without driving it. The driving waker is unchanged.
    pub(crate) fn park(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        match slot {
            Some(token) => self.replace_waker(token, waker),
            None => *slot = Some(self.add_waker(waker.clone())),
        }
    }

    /// True if the future holding `token` may drive the shared work: either
    /// it's already the driver, or nobody is.
    pub(crate) fn may_drive(&self, token: Option<&Token>) -> bool {
        match self.driving_waker {
            None => true,
            Some(ref driver) => Some(driver) == token,
        }
    }

    #[must_use]
    fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .get()
            .checked_add(1)
            .and_then(NonZeroUsize::new)
            .expect("Overflow when creating token");

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Panics if the token is not present in the set.
    fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        self.wakers
            .get_mut(token)
            .expect("Attempted to add Waker to WakerSet with an invalid token")
            .clone_from(waker);
    }

    /// Discard a waker from this set without waking anyone. Only use this
    /// when there's no more shared work to drive; otherwise, prefer
    /// discard_and_wake.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) {
            self.driving_waker = None;
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is currently no driving waker), an arbitrary waker is
    /// made the current driving waker and awoken.
    ///
    /// We create a new driving waker immediately because if a series of drops
    /// happen at the same time we need to ensure that at least one non-dropped
    /// waker is awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((token, waker)) => {
                    self.driving_waker = Some(token.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake every waker in the set except `current`, which is the one
    /// currently polling. The wakers stay in the set.
    pub(crate) fn wake_others(&self, current: Option<&Token>) {
        self.wakers
            .iter()
            .filter(|(token, _waker)| Some(*token) != current)
            .for_each(|(_token, waker)| waker.wake_by_ref());
    }
}
