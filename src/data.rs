//! Data structures for passing keys into a bulk fetch, and its results back
//! out to the waiting futures.

use std::borrow::Borrow;
use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::num::NonZeroUsize;

use crate::error::IntoValuesError;

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Self {
        Token(self.0)
    }
}

/// A set of keys passed into a bulk fetch function. Use the `keys` method
/// to get the set of keys, all of which will be unique, so that you can
/// execute your request. Then, use one of the `into_*` or `*_from_iter`
/// methods to transform your response data into a [`ValueSet`], which is
/// handed back to the batcher.
#[derive(Debug)]
pub struct KeySet<Key: Eq + Hash> {
    // In order to not require cloneable keys, this structure associates each
    // key with two pieces of information:
    //
    // - a Token, which is held in the route of each request. The token is
    // uniquely associated with a key for a given KeySet.
    // - A count of how many requests are waiting on the same key. This count
    // specifically is the number of requests *past the first*; in other
    // words, it's the number of times the result will need to be cloned.
    keys: HashMap<Key, Token>,
    tokens: HashMap<Token, usize>,
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// key. This token can then be used to pull a result out of the ValueSet
    /// created from this KeySet.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let new_token = Token(NonZeroUsize::new(self.keys.len() + 1).unwrap());
        let token = self.keys.entry(key).or_insert(new_token).duplicate();
        self.tokens
            .entry(token.duplicate())
            .and_modify(|count| *count += 1)
            .or_insert(0);

        token
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be:
    ///
    /// - Unique
    /// - Between 1 and the configured max batch size of the related
    ///   BatchRules
    /// - In an arbitrary order
    pub fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        self.keys.keys()
    }

    /// Create an empty [`ValueSet`] for this set of keys. Results are added
    /// with [`ValueSet::insert`]; any key left without a result resolves to
    /// `None` for its requesters.
    pub fn into_value_set<Value, Error>(self) -> ValueSet<Key, Value, Error> {
        let KeySet { keys, tokens } = self;

        ValueSet {
            index: keys,
            entries: tokens
                .into_iter()
                .map(|(token, count)| {
                    (
                        token,
                        ValueSetEntry {
                            count,
                            result: None,
                        },
                    )
                })
                .collect(),
        }
    }

    /// After you've completed your request, use this method to pair each value
    /// in your result with its key. Every key receives a value.
    pub fn into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Value,
    ) -> ValueSet<Key, Value, Error> {
        self.into_results(move |key| Ok(get_value(key)))
    }

    /// Same as into_values, but each key can individually fail. A failed key
    /// rejects only the requests for that key.
    pub fn into_results<Value, Error>(
        self,
        mut get_result: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> ValueSet<Key, Value, Error> {
        let mut values = self.into_value_set();
        let ValueSet { index, entries } = &mut values;

        for (key, token) in index.iter() {
            if let Some(entry) = entries.get_mut(token) {
                entry.result = Some(get_result(key));
            }
        }

        values
    }

    /// Build a [`ValueSet`] out of a collection of values which each know
    /// their own key. Keys with no matching value resolve to `None`. Returns
    /// an error if a value has a key that wasn't requested, or if a key
    /// repeats and `on_duplicate` is [`OnDuplicate::Fail`].
    pub fn values_from_iter<Q, Value, Error>(
        self,
        on_duplicate: OnDuplicate,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<ValueSet<Key, Value, Error>, IntoValuesError>
    where
        Key: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
        Value: KeyedEntry<Q>,
    {
        let mut set = self.into_value_set();

        for value in values {
            let token = set
                .token_of(value.get_key())
                .ok_or(IntoValuesError::UnknownKey)?;
            set.fill(&token, Ok(value), on_duplicate)?;
        }

        Ok(set)
    }

    /// Build a [`ValueSet`] out of key-result pairs, such as a `HashMap`
    /// returned from a database layer. The same rules as
    /// [`values_from_iter`][KeySet::values_from_iter] apply.
    pub fn results_from_iter<Value, Error>(
        self,
        on_duplicate: OnDuplicate,
        results: impl IntoIterator<Item = (Key, Result<Value, Error>)>,
    ) -> Result<ValueSet<Key, Value, Error>, IntoValuesError> {
        let mut set = self.into_value_set();

        for (key, result) in results {
            let token = set.token_of(&key).ok_or(IntoValuesError::UnknownKey)?;
            set.fill(&token, result, on_duplicate)?;
        }

        Ok(set)
    }
}

/// Trait for values which contain their own key, such as rows returned by a
/// database. Used with [`KeySet::values_from_iter`].
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

/// What to do when a value is supplied more than once for the same key while
/// building a [`ValueSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Keep the first value; later ones are dropped.
    Ignore,
    /// Keep the last value.
    Replace,
    /// Fail with [`IntoValuesError::DuplicateKey`].
    Fail,
}

#[derive(Debug)]
struct ValueSetEntry<Value, Error> {
    count: usize,
    result: Option<Result<Value, Error>>,
}

/// A value set is the keyed result of a bulk fetch. It can only be created
/// from the [`KeySet`] it answers, and it is used by the batcher to
/// distribute the results to the correct waiting futures.
///
/// Each key maps to a value, an error, or nothing at all. An error rejects
/// only the requests for its key; a missing key resolves its requests to
/// `None`.
#[derive(Debug)]
pub struct ValueSet<Key, Value, Error> {
    index: HashMap<Key, Token>,
    entries: HashMap<Token, ValueSetEntry<Value, Error>>,
}

impl<Key: Eq + Hash, Value, Error> ValueSet<Key, Value, Error> {
    fn token_of<Q>(&self, key: &Q) -> Option<Token>
    where
        Key: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        self.index.get(key).map(Token::duplicate)
    }

    fn fill(
        &mut self,
        token: &Token,
        result: Result<Value, Error>,
        on_duplicate: OnDuplicate,
    ) -> Result<(), IntoValuesError> {
        let entry = self
            .entries
            .get_mut(token)
            .ok_or(IntoValuesError::UnknownKey)?;

        match (&entry.result, on_duplicate) {
            (Some(..), OnDuplicate::Ignore) => {}
            (Some(..), OnDuplicate::Fail) => return Err(IntoValuesError::DuplicateKey),
            (None, _) | (Some(..), OnDuplicate::Replace) => entry.result = Some(result),
        }

        Ok(())
    }

    /// Set the result for a key, returning the previous result if there was
    /// one. Fails if the key wasn't part of the originating [`KeySet`].
    pub fn insert<Q>(
        &mut self,
        key: &Q,
        result: Result<Value, Error>,
    ) -> Result<Option<Result<Value, Error>>, IntoValuesError>
    where
        Key: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let token = self.token_of(key).ok_or(IntoValuesError::UnknownKey)?;
        let entry = self
            .entries
            .get_mut(&token)
            .ok_or(IntoValuesError::UnknownKey)?;

        Ok(entry.result.replace(result))
    }

    /// Resolve a key with a value.
    pub fn resolve<Q>(
        &mut self,
        key: &Q,
        value: Value,
    ) -> Result<Option<Result<Value, Error>>, IntoValuesError>
    where
        Key: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        self.insert(key, Ok(value))
    }

    /// Reject a key with an error.
    pub fn reject<Q>(
        &mut self,
        key: &Q,
        error: Error,
    ) -> Result<Option<Result<Value, Error>>, IntoValuesError>
    where
        Key: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        self.insert(key, Err(error))
    }

    /// Check if a result has been supplied for this key
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        self.token_of(key)
            .and_then(|token| self.entries.get(&token))
            .map_or(false, |entry| entry.result.is_some())
    }
}

impl<Key, Value, Error> ValueSet<Key, Value, Error> {
    /// The number of keys which have a result
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.result.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard a token associated with this ValueSet without getting the
    /// result. No-op if the token isn't present.
    pub(crate) fn discard(&mut self, token: Token) {
        match self.entries.entry(token) {
            Entry::Vacant(..) => {}
            Entry::Occupied(entry) if entry.get().count == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().count -= 1;
            }
        }
    }
}

impl<Key, Value: Clone, Error: Clone> ValueSet<Key, Value, Error> {
    /// Take the result associated with a token out of this ValueSet. If the
    /// count of this token is > 0, the result is cloned. The outer `None`
    /// means the token is unknown; `Some(None)` means the bulk fetch didn't
    /// supply a result for the key.
    ///
    /// This function takes a Token by move, to help ensure that that token
    /// cannot be reused to take the same result again by accident.
    pub(crate) fn take(&mut self, token: Token) -> Option<Option<Result<Value, Error>>> {
        match self.entries.entry(token) {
            Entry::Vacant(..) => None,
            Entry::Occupied(entry) if entry.get().count == 0 => Some(entry.remove().result),
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.count -= 1;
                Some(entry.result.clone())
            }
        }
    }
}
