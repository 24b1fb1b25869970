//! Settable, observable, cancellable promises
//!
//! The promise is the pipe the rest of the toolkit speaks through: services
//! report start and stop completions over it, the time limiter signals
//! deadline expiry with it, and the combinator family composes promises
//! into aggregates, transforms and fallbacks.

mod cell;
mod combinators;
mod stack;
mod task;

pub use cell::{CancellationCause, CheckedError, Promise};
pub use combinators::{
    all_as_list, in_completion_order, non_cancellation_propagating, successful_as_list,
    transform, transform_async, with_fallback,
};
pub use task::submit;
