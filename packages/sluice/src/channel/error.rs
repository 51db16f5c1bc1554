// channel error types.

use thiserror::Error;


// ==== base error types ====


/// Error for trying to write into a channel which has been closed
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("write to closed channel")]
pub struct ChannelClosedError;

/// Error for attempting a channel operation without blocking, and the operation not being able
/// to complete immediately
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("operation would block")]
pub struct WouldBlockError;

/// Error for taking the outcome of a select case which has not been resolved
///
/// This is a programmer error: a case only has an outcome once [`select`](crate::select()) or
/// [`try_invoke`](crate::SelectCase::try_invoke) has resolved it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("case read before it was resolved")]
pub struct CaseNotReadyError;


// ==== compound error types ====


/// Error for trying to write into a channel which has been closed, handing the message back
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("{cause}")]
pub struct WriteError<T> {
    /// The message that could not be written
    pub msg: T,
    /// The reason the message could not be written
    pub cause: ChannelClosedError,
}

macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Reason a non-blocking write failed
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
pub enum TryWriteErrorCause {
    /// The channel is closed
    #[error(transparent)]
    Closed(ChannelClosedError),
    /// The channel has neither buffer space nor a waiting reader
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TryWriteErrorCause {
    Closed(ChannelClosedError),
    WouldBlock(WouldBlockError),
});

/// Error for trying to write into a channel without blocking, handing the message back
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("{cause}")]
pub struct TryWriteError<T> {
    /// The message that could not be written
    pub msg: T,
    /// The reason the message could not be written
    pub cause: TryWriteErrorCause,
}

impl<T> TryWriteError<T> {
    /// Whether the write failed because the channel is closed
    pub fn is_closed(&self) -> bool {
        matches!(self.cause, TryWriteErrorCause::Closed(_))
    }

    /// Whether the write failed because it would have had to wait
    pub fn is_would_block(&self) -> bool {
        matches!(self.cause, TryWriteErrorCause::WouldBlock(_))
    }
}

impl<T> From<WriteError<T>> for TryWriteError<T> {
    fn from(e: WriteError<T>) -> Self {
        TryWriteError { msg: e.msg, cause: e.cause.into() }
    }
}
