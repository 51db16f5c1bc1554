//! CSP-style channels, select, and hierarchical cancellation contexts.
//!
//! - [`Channel`] is a buffered or unbuffered multi-producer multi-consumer channel which can be
//!   closed. Reads and writes are futures, with non-blocking variants.
//! - [`select()`] races read and write cases on any number of channels, completing exactly one.
//! - [`Context`] carries cancellation, deadlines and request-scoped values down a tree of
//!   operations, signalling cancellation by closing a channel.
//! - The [`time`] module has timers and tickers which deliver over channels.

#[macro_use]
extern crate tracing;

mod channel;
mod select;
mod context;
mod util;
pub mod time;

pub use crate::{
    channel::api::*,
    select::{
        case::{ReadCase, SelectCase, WriteCase},
        select,
        try_select,
        Selected,
    },
    context::{background, todo, CancelContext, Context, ContextKey},
};

/// Error types
pub mod error {
    pub use crate::{
        channel::error::*,
        context::ContextError,
    };
}

/// Future types
pub mod future {
    pub use crate::{
        channel::api::future::*,
        select::SelectFut,
    };
}
