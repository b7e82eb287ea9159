//! Compile-time callback shapes
//!
//! Continuations accept callbacks of three shapes, told apart by a marker
//! type the compiler infers at the call site:
//!
//! | Marker | Callback | Receives |
//! |---|---|---|
//! | [`NoArg`] | `FnOnce() -> R` | nothing |
//! | [`ValueArg`] | `FnOnce(T) -> R` | a clone of the first result |
//! | [`FutureArg`] | `FnOnce(Future<T>) -> R` | the source future itself |
//!
//! [`IsFuture`] marks return types that are futures, which selects the
//! flattening path ([`Observable::and_then`](crate::Observable::and_then)).
//!
//! Shape mismatches are rejected by the compiler. Two arguments:
//!
//! ```compile_fail
//! use rust_deferred::{deferred, observe};
//!
//! let d = deferred::<i32>();
//! observe(d.future()).then(|a: i32, b: i32| a + b);
//! ```
//!
//! An argument type that does not match the future:
//!
//! ```compile_fail
//! use rust_deferred::{deferred, observe};
//!
//! let d = deferred::<i32>();
//! observe(d.future()).then(|s: String| s.len());
//! ```
//!
//! A valueless future observed with a value-taking callback:
//!
//! ```compile_fail
//! use rust_deferred::{deferred, observe};
//!
//! let d = deferred::<()>();
//! observe(d.future()).then(|v: i32| v + 1);
//! ```
//!
//! Flattening a callback that does not return a future:
//!
//! ```compile_fail
//! use rust_deferred::{deferred, observe};
//!
//! let d = deferred::<i32>();
//! observe(d.future()).and_then(|v: i32| v + 1);
//! ```

use crate::future::Future;

/// Marker for callbacks taking no argument
#[derive(Debug)]
pub enum NoArg {}

/// Marker for callbacks taking the source's result value
#[derive(Debug)]
pub enum ValueArg {}

/// Marker for callbacks taking the source future
#[derive(Debug)]
pub enum FutureArg {}

/// A continuation callback over a `Future<T>`, shaped by `M`
pub trait Callback<T, M>: Send + 'static {
    /// What the callback receives
    type Arg;
    /// What the callback returns
    type Output;
    /// Number of arguments, 0 or 1
    const ARITY: usize;

    /// Call with what the source provides.
    ///
    /// Returns `None` when the source has no value for a value-taking callback.
    fn invoke(self, source: &Future<T>) -> Option<Self::Output>;
}

impl<T, F, R> Callback<T, NoArg> for F
where
    F: FnOnce() -> R + Send + 'static,
{
    type Arg = ();
    type Output = R;
    const ARITY: usize = 0;

    fn invoke(self, _source: &Future<T>) -> Option<R> {
        Some(self())
    }
}

impl<T, F, R> Callback<T, ValueArg> for F
where
    T: Clone,
    F: FnOnce(T) -> R + Send + 'static,
{
    type Arg = T;
    type Output = R;
    const ARITY: usize = 1;

    fn invoke(self, source: &Future<T>) -> Option<R> {
        source.result().map(self)
    }
}

impl<T, F, R> Callback<T, FutureArg> for F
where
    F: FnOnce(Future<T>) -> R + Send + 'static,
{
    type Arg = Future<T>;
    type Output = R;
    const ARITY: usize = 1;

    fn invoke(self, source: &Future<T>) -> Option<R> {
        Some(self(source.clone()))
    }
}

/// Implemented by future types; names what they resolve to
pub trait IsFuture {
    type Item;

    fn into_host(self) -> Future<Self::Item>;
}

impl<T> IsFuture for Future<T> {
    type Item = T;

    fn into_host(self) -> Future<T> {
        self
    }
}

/// Marker for progress callbacks returning whether to keep listening
#[derive(Debug)]
pub enum UntilFalse {}

/// Marker for progress callbacks that listen until the future finishes
#[derive(Debug)]
pub enum Always {}

/// A progress callback, either `FnMut() -> bool` or `FnMut()`
pub trait ProgressCallback<M>: Send + 'static {
    /// Returns false to stop receiving progress
    fn on_progress(&mut self) -> bool;
}

impl<F> ProgressCallback<UntilFalse> for F
where
    F: FnMut() -> bool + Send + 'static,
{
    fn on_progress(&mut self) -> bool {
        self()
    }
}

impl<F> ProgressCallback<Always> for F
where
    F: FnMut() + Send + 'static,
{
    fn on_progress(&mut self) -> bool {
        self();
        true
    }
}

/// Number of arguments `callback` takes when observing a `Future<T>`
pub fn arity<T, M, C: Callback<T, M>>(_callback: &C) -> usize {
    C::ARITY
}
