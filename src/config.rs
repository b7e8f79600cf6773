use std::num::NonZeroUsize;

/// Options for a [`BatchRules`][crate::BatchRules].
///
/// With the `serde` feature enabled, this can be deserialized from a
/// configuration file; missing fields take their default values.
///
/// ```
/// use batcher::BatchOptions;
///
/// assert_eq!(BatchOptions::default().max_batch_size, 128);
/// assert_eq!(BatchOptions::unbounded().batch_limit(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct BatchOptions {
    /// The maximum number of requests sent in a single bulk fetch. If a
    /// drained queue has more requests than this, it is split into several
    /// consecutive sub-batches, each fetched independently. 0 means no limit.
    pub max_batch_size: usize,
}

impl BatchOptions {
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 128;

    /// Options which never split a drained queue.
    pub fn unbounded() -> Self {
        Self { max_batch_size: 0 }
    }

    /// The configured limit, or `None` if the batch size is unbounded.
    pub fn batch_limit(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_batch_size)
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
        }
    }
}
