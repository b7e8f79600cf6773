use thiserror::Error;

/// The error produced by a [`BatchFuture`][crate::BatchFuture].
///
/// Both variants carry the error produced by the bulk fetch function; the
/// variant records whether it applied to the whole sub-batch the request was
/// dispatched in, or only to the request's own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum LoadError<E> {
    /// The bulk fetch failed outright. Every request in the same sub-batch
    /// fails with a clone of this error.
    #[error("bulk fetch failed: {0}")]
    Batch(E),

    /// The bulk fetch succeeded, but returned an error for this key.
    #[error("fetch failed for key: {0}")]
    Key(E),
}

impl<E> LoadError<E> {
    pub fn get_ref(&self) -> &E {
        match self {
            LoadError::Batch(err) | LoadError::Key(err) => err,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            LoadError::Batch(err) | LoadError::Key(err) => err,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, LoadError::Batch(..))
    }

    pub fn is_key(&self) -> bool {
        matches!(self, LoadError::Key(..))
    }
}

/// Error building a [`ValueSet`][crate::ValueSet] from data returned by a
/// bulk fetch. These indicate a broken bulk fetch implementation, rather than
/// a failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum IntoValuesError {
    #[error("a value was supplied for a key that wasn't requested")]
    UnknownKey,

    #[error("more than one value was supplied for the same key")]
    DuplicateKey,
}
