//! Batcher coalesces many independent, concurrently-issued lookups into
//! grouped calls to a bulk fetch operation, then distributes the results
//! back to each requester, without the requester knowing anything about the
//! bulk operation. Every lookup issued during the same scheduling turn (or,
//! more generally, the same window) shares a single dispatch. The common use
//! case for this is resolving many fields of a GraphQL response, each of
//! which needs one row from a database that is much happier to hand out rows
//! in bulk.
//!
//! ## Overview
//!
//! As a simple example, suppose you had an API to fetch user data by username.
//! The API supports batching; that is, you can supply multiple usernames in
//! the same request and it will return results for all of them. The entry
//! point might look like this:
//!
//! ```
//! #[derive(Debug, Clone)]
//! struct UserData {
//!     username: String,
//!     name: String,
//!     age: u16,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct APIError {}
//!
//! async fn get_users(usernames: impl Iterator<Item=String>) ->
//!     Result<Vec<UserData>, APIError>
//! {
//!     todo!()
//! }
//! ```
//!
//! However, your application only needs information for a single user at a
//! time, in many places at once. You still want to be able to batch these
//! requests, to reduce API pressure; this is where batcher comes in.
//!
//! First, your bulk fetch function should be adapted to the batcher API.
//! A bulk fetch function takes a [`KeySet<K>`], which contains all the
//! (deduplicated) keys to be fetched, and returns a
//! `Result<ValueSet<K, V, E>, E>`. A [`ValueSet`] contains the result for
//! each key: a value, an error for that specific key, or nothing at all.
//! Returning `Err` from the bulk fetch fails every request in the batch.
//!
//! ```
//! use batcher::{KeySet, ValueSet, KeyedEntry, OnDuplicate};
//! # #[derive(Debug, Clone)] struct UserData { username: String, name: String, age: u16 }
//! # #[derive(Debug, Clone)] struct APIError {}
//! # async fn get_users(usernames: impl Iterator<Item=String>) ->
//! #    Result<Vec<UserData>, APIError> {Ok(vec![])}
//!
//! impl KeyedEntry<str> for UserData {
//!     fn get_key(&self) -> &str {
//!         &self.username
//!     }
//! }
//!
//! async fn batch_get_users(usernames: KeySet<String>) ->
//!     Result<ValueSet<String, UserData, APIError>, APIError>
//! {
//!     // perform the API request
//!     let users = get_users(usernames.keys().cloned()).await?;
//!
//!     // Usernames with no matching user are left out of the ValueSet, and
//!     // will resolve to `None`. An unrecognized username is a bug in the
//!     // API, so we'll treat that as an error for the whole batch.
//!     let users = usernames
//!         .values_from_iter(OnDuplicate::Ignore, users)
//!         .map_err(|_| APIError {})?;
//!
//!     Ok(users)
//! }
//! ```
//!
//! There are a few other methods available to create a [`ValueSet`],
//! depending on the shape of your data; see the [`KeySet`] documentation for
//! details.
//!
//! Once you have a bulk fetch function compatible with `batcher`, create a
//! [`Batcher`]. A `Batcher` coordinates the batching logic, pooling different
//! requests together. It can be shared by reference to your request handlers,
//! such that many independent async tasks (even on different threads) can
//! batch individual key lookups into the same bulk fetch.
//!
//! The [`Batcher`] is configured by [`BatchRules`], which has 3 fields:
//! - The `batcher` has already been described; it's the asynchronous function
//!   that actually does the work.
//! - `window` is a [`Window`], which defines how long requests are collected
//!   after the first one arrives. The default, [`NextTick`], collects every
//!   request made before the executor comes back around to the future that
//!   opened the window, which is the right choice for resolvers that all run
//!   in the same task.
//!   [`Sleep`] waits for a fixed duration instead, which lets requests from
//!   unrelated tasks meet in the same batch.
//! - `max_batch_size` is an optional maximum number of requests per bulk
//!   fetch. If a window collects more requests than this, they are split
//!   into consecutive sub-batches, each sent in a separate bulk fetch. The
//!   default is 128; see [`BatchOptions`].
//!
//! ```
//! use std::time::Duration;
//! use batcher::{Batcher, BatchOptions, BatchRules, Sleep};
//! # use batcher::{KeySet, ValueSet};
//! # #[derive(Debug, Clone)] struct UserData { username: String }
//! # #[derive(Debug, Clone)] struct APIError {}
//! # async fn batch_get_users(usernames: KeySet<String>) ->
//! #     Result<ValueSet<String, UserData, APIError>, APIError> { todo!() }
//!
//! // BatchRules has to be passed by reference so that the `batcher`
//! // function can be called by reference.
//! let rules = BatchRules::with_options(batch_get_users, BatchOptions { max_batch_size: 50 })
//!     .with_window(Sleep(Duration::from_millis(1)));
//! let batcher = Batcher::new(&rules);
//! ```
//!
//! Once you have a [`Batcher`], you can begin loading batched data with
//! the [`run`] method. [`run`] is called with a single key, and creates
//! a [`BatchFuture`] associated with that key. Once the window closes,
//! polling the [`BatchFuture`] will drive the bulk fetches, and once they
//! complete, each [`BatchFuture`] will complete with the result associated
//! with its individual key.
//!
//! ```
//! use batcher::{Batcher, BatchRules, KeySet, LoadError, ValueSet};
//! use futures::{executor, future};
//!
//! async fn squares(keys: KeySet<u32>) -> Result<ValueSet<u32, u32, String>, String> {
//!     Ok(keys.into_results(|&key| match key {
//!         0 => Err("zero is boring".to_owned()),
//!         key => Ok(key * key),
//!     }))
//! }
//!
//! let rules = BatchRules::new(squares);
//! let batcher = Batcher::new(&rules);
//!
//! // All three requests are sent in a single call to `squares`
//! let results = executor::block_on(future::join3(
//!     batcher.run(3),
//!     batcher.run(0),
//!     batcher.run(3),
//! ));
//!
//! assert_eq!(results.0, Ok(Some(9)));
//! assert_eq!(results.1, Err(LoadError::Key("zero is boring".to_owned())));
//! assert_eq!(results.2, Ok(Some(9)));
//! ```
//!
//! ## Design notes
//!
//! ### `KeySet` and `ValueSet`
//!
//! Traditional dataloader implementations use batching functions that simply
//! take a list of keys and return a same-length list of values (or a loosely
//! typed map) that are paired with those keys. While it maximizes simplicity,
//! there are a few problems with this approach:
//!
//! - The interface has no way to guarantee that the returned values actually
//!   correspond to the requested keys. This is a logic error in the
//!   implementation, but there isn't really a good way to report this error
//!   to the developer.
//! - The interface doesn't account at all for duplicate keys; it assumes that
//!   each incoming request is unique.
//!
//! To solve both of these problems, batcher uses the [`KeySet`] type for
//! incoming keys to a bulk fetch, and the [`ValueSet`] type for outgoing
//! results. The only way to create a [`ValueSet`] is with one of the methods
//! on [`KeySet`]; results for keys that weren't requested are rejected with
//! an [`IntoValuesError`].
//!
//! In addition, the [`KeySet`] deduplicates incoming keys, and only passes
//! unique keys to the bulk fetch. The [`ValueSet`] internally stores how
//! many requests for a key have been made, and uses cloning to give out
//! results to different futures (past the first) associated with the same
//! key. In the common case of no key duplicates, no clones will occur.
//!
//! A key with no result in the [`ValueSet`] resolves its requests to `None`,
//! rather than failing them. Whether a missing key is an error is up to the
//! bulk fetch: it can always [`reject`][ValueSet::reject] the key explicitly.
//!
//! ### Poll-driven design.
//!
//! In keeping with the Rust's polling async design, all of the asynchronous
//! work in batcher is driven through polling [`BatchFuture`]. Neither the
//! window nor the bulk fetches are scheduled in any runtime or run in the
//! background; they are driven directly in the foreground by `BatchFuture`.
//!
//! The polling is designed to be as lazy as possible. Because the shared
//! work only needs to be driven by a single task, BatchFuture tracks and
//! notifies only a single task to drive it forward; only that task polls the
//! window. The other futures are woken only when results are available (or
//! when the driving future settles or is dropped), and a future whose result
//! is already available collects it without touching the bulk fetches that
//! are still running.
//!
//! ### Threads
//!
//! Each [`Batcher`] guards its current cycle with a mutex, and each cycle
//! guards its own queue. Enqueueing a request and draining the queue happen
//! under the same lock, so a request is always either in the cycle being
//! drained, or in the next one; never both, and never neither.
//!
//! [`run`]: Batcher::run

mod batch;
mod config;
mod data;
mod dispatch;
mod error;
mod queue;
mod wakerset;
mod window;

pub use batch::{BatchFuture, BatchRules, Batcher};
pub use config::BatchOptions;
pub use data::{KeySet, KeyedEntry, OnDuplicate, ValueSet};
pub use error::{IntoValuesError, LoadError};
pub use window::{NextTick, Sleep, Window, YieldNow};
