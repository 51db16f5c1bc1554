// exposed API of channels

use self::future::*;
use super::{
    error::*,
    core::{self, Attempt},
};
use crate::select::case::{ReadCase, WriteCase};
use std::{
    fmt::{self, Debug, Formatter},
    sync::OnceLock,
};


/// In-process channel with an optional fixed-capacity buffer
///
/// Handles are cheap to clone and all refer to the same channel. With capacity zero, the
/// channel is unbuffered: a write completes only once handed directly to a reader.
///
/// When several readers (or writers) are waiting on the same channel, the one served by the
/// next handoff is chosen uniformly at random rather than in arrival order. Buffered messages
/// are always read in the order they were written.
///
/// Closing is permanent. Messages already buffered when the channel closes remain readable;
/// once drained, reads resolve to `None`.
pub struct Channel<T>(core::Channel<T>);

impl<T> Channel<T> {
    /// Create a channel which buffers up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Channel(core::Channel::new(capacity))
    }

    /// Create a future to read a message from this channel
    ///
    /// Resolves to `Some(msg)`, or to `None` if the channel is closed and no buffered messages
    /// remain. Dropping the future before it resolves abandons the read without losing any
    /// message.
    pub fn read(&self) -> ReadFut<T> {
        ReadFut::new(self.read_case())
    }

    /// Try to read a message without blocking
    ///
    /// Errors if the read would have had to wait.
    pub fn try_read(&self) -> Result<Option<T>, WouldBlockError> {
        match self.0.lock().try_read(None) {
            Attempt::Ready(outcome) => Ok(outcome),
            Attempt::WouldBlock(()) | Attempt::Preempted(()) => Err(WouldBlockError),
        }
    }

    /// Create a future to write a message into this channel
    ///
    /// Resolves to ok once the message is buffered or handed to a reader, or to an error
    /// carrying the message back if the channel is or becomes closed first. Dropping the
    /// future before it resolves abandons the write.
    pub fn write(&self, msg: T) -> WriteFut<T> {
        WriteFut::new(WriteCase::new(self.0.clone(), msg, None, false))
    }

    /// Try to write a message without blocking
    ///
    /// On error, the message is handed back alongside whether the channel was closed or the
    /// write would have had to wait.
    pub fn try_write(&self, msg: T) -> Result<(), TryWriteError<T>> {
        match self.0.lock().try_write(msg, None) {
            Attempt::Ready(Ok(())) => Ok(()),
            Attempt::Ready(Err(msg)) => Err(TryWriteError { msg, cause: ChannelClosedError.into() }),
            Attempt::WouldBlock(msg) | Attempt::Preempted(msg) => {
                Err(TryWriteError { msg, cause: WouldBlockError.into() })
            }
        }
    }

    /// Close the channel
    ///
    /// Returns false if it was already closed. Waiting readers resolve to `None` and waiting
    /// writers fail. Buffered messages are kept.
    pub fn close(&self) -> bool {
        self.0.lock().close()
    }

    /// Whether the channel has been closed
    ///
    /// A closed channel may still hold buffered messages.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether no messages are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }

    /// Create a reusable read case for [`select`](crate::select())
    pub fn read_case(&self) -> ReadCase<T> {
        ReadCase::new(self.0.clone())
    }

    /// Create a reusable write case for [`select`](crate::select())
    ///
    /// If `throw_on_closed` is true, a closed channel makes the select error with
    /// [`ChannelClosedError`] rather than resolving the case with a `false` outcome.
    pub fn write_case(&self, msg: T, throw_on_closed: bool) -> WriteCase<T>
    where
        T: Clone,
    {
        WriteCase::new(self.0.clone(), msg, Some(T::clone as fn(&T) -> T), throw_on_closed)
    }

    /// Whether both handles refer to the same channel
    pub fn same_channel(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// Create a stream of messages read from this channel, ending once it is closed and drained
    #[cfg(feature = "futures")]
    pub fn stream(&self) -> ReadStream<T> {
        ReadStream { channel: self.clone(), fut: None }
    }
}

impl Channel<()> {
    /// Process-wide channel that is never closed and can never be written to
    ///
    /// Reads from it wait forever. It is the done channel of contexts that can never be
    /// cancelled.
    pub fn never() -> Self {
        static NEVER: OnceLock<Channel<()>> = OnceLock::new();
        NEVER.get_or_init(|| Channel(core::Channel::sentinel(false))).clone()
    }

    /// Process-wide channel that is already closed
    ///
    /// Reads from it resolve to `None` immediately.
    pub fn closed() -> Self {
        static CLOSED: OnceLock<Channel<()>> = OnceLock::new();
        CLOSED.get_or_init(|| Channel(core::Channel::sentinel(true))).clone()
    }

    /// Whether this is the [`never`](Self::never) channel
    pub fn is_never(&self) -> bool {
        self.same_channel(&Self::never())
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(self.0.clone())
    }
}

impl<T> Debug for Channel<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use crate::{
        channel::waiter::Claim,
        select::case::{sealed::Sealed, Registration},
    };
    use std::{
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };

    // drive a single case to completion with a claim of its own. returns whether it resolved.
    fn poll_case<C: Sealed>(
        case: &mut C,
        claim: &Arc<Claim>,
        registered: &mut bool,
        cx: &mut Context,
    ) -> bool {
        claim.set_waker(cx.waker());
        if !*registered {
            *registered = true;
            match case.register(claim) {
                Registration::Ready => return true,
                Registration::Parked => (),
                Registration::Preempted => unreachable!("lone claim taken before registering"),
                Registration::Skipped => unreachable!("one-shot write without a payload"),
            }
        }
        case.poll_registration()
    }

    /// Future for reading from a [`Channel`]
    ///
    /// Resolves to `Some(msg)`, or `None` if the channel is closed and drained.
    pub struct ReadFut<T> {
        case: ReadCase<T>,
        claim: Arc<Claim>,
        registered: bool,
        terminated: bool,
    }

    impl<T> ReadFut<T> {
        pub(super) fn new(case: ReadCase<T>) -> Self {
            ReadFut { case, claim: Claim::new(), registered: false, terminated: false }
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.terminated
        }
    }

    // no pinned projection: the case is only ever accessed by &mut
    impl<T> Unpin for ReadFut<T> {}

    impl<T> Future for ReadFut<T> {
        type Output = Option<T>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.terminated {
                return Poll::Pending;
            }
            if poll_case(&mut this.case, &this.claim, &mut this.registered, cx) {
                this.terminated = true;
                Poll::Ready(this.case.read())
            } else {
                Poll::Pending
            }
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for ReadFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    /// Future for writing into a [`Channel`]
    ///
    /// Resolves to ok once written, or to [`WriteError`] carrying the message back if the
    /// channel is or becomes closed first.
    pub struct WriteFut<T> {
        case: WriteCase<T>,
        claim: Arc<Claim>,
        registered: bool,
        terminated: bool,
    }

    impl<T> WriteFut<T> {
        pub(super) fn new(case: WriteCase<T>) -> Self {
            WriteFut { case, claim: Claim::new(), registered: false, terminated: false }
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.terminated
        }
    }

    impl<T> Unpin for WriteFut<T> {}

    impl<T> Future for WriteFut<T> {
        type Output = Result<(), WriteError<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            if this.terminated {
                return Poll::Pending;
            }
            if !poll_case(&mut this.case, &this.claim, &mut this.registered, cx) {
                return Poll::Pending;
            }
            this.terminated = true;
            if this.case.written() {
                Poll::Ready(Ok(()))
            } else {
                let msg = this.case.take_payload()
                    .expect("failed write case lost its payload (internal bug)");
                Poll::Ready(Err(WriteError { msg, cause: ChannelClosedError }))
            }
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for WriteFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    /// Stream of messages read from a [`Channel`], created by [`Channel::stream`]
    #[cfg(feature = "futures")]
    pub struct ReadStream<T> {
        pub(super) channel: Channel<T>,
        pub(super) fut: Option<ReadFut<T>>,
    }

    #[cfg(feature = "futures")]
    impl<T> Unpin for ReadStream<T> {}

    #[cfg(feature = "futures")]
    impl<T> futures::Stream for ReadStream<T> {
        type Item = T;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<T>> {
            let this = self.get_mut();
            let fut = this.fut.get_or_insert_with(|| this.channel.read());
            match Pin::new(fut).poll(cx) {
                Poll::Ready(item) => {
                    this.fut = None;
                    Poll::Ready(item)
                }
                Poll::Pending => Poll::Pending,
            }
        }
    }
}


// ==== tests ====
