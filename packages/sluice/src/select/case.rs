//! Select cases: reusable read / write operations bound to a channel.

use crate::{
    channel::{
        core::{self, Attempt, Parked},
        waiter::{Claim, Slot, WriteOutcome},
    },
    error::{CaseNotReadyError, ChannelClosedError},
};
use std::sync::Arc;


// outcome of registering a case with a select's claim.
pub enum Registration {
    // the case completed during registration, using the claim.
    Ready,
    // a waiter was parked.
    Parked,
    // the claim was already taken by another case of the same select.
    Preempted,
    // the case has nothing to attempt and was not registered.
    Skipped,
}

pub(crate) mod sealed {
    use super::*;

    // crate-internal hooks used by `select`. sealing them keeps `SelectCase` implementable only
    // by the case types of this crate.
    pub trait Sealed {
        // try to complete using the claim, otherwise park a waiter holding it.
        fn register(&mut self, claim: &Arc<Claim>) -> Registration;

        // if a parked waiter was completed, take its outcome. returns whether it was.
        fn poll_registration(&mut self) -> bool;

        // retract a parked waiter, if any. an element already handed to a retracted read is
        // restored to its channel, and an element handed back to a retracted write is restored
        // to the case.
        fn disconnect(&mut self);

        // for a resolved case, whether it should surface as a `ChannelClosedError`.
        fn thrown(&self) -> Result<(), ChannelClosedError>;
    }
}

/// An operation that can be raced by [`select`](crate::select())
///
/// Implemented by [`ReadCase`] and [`WriteCase`]. A case moves from unset to ready through
/// [`try_invoke`](Self::try_invoke) or by winning a select, and back to unset through
/// [`reset`](Self::reset).
pub trait SelectCase: sealed::Sealed + Send {
    /// Clear the cached outcome
    fn reset(&mut self);

    /// Whether the case has an outcome
    fn is_ready(&self) -> bool;

    /// Try to complete the operation without blocking
    ///
    /// Returns whether the case became ready. Errors only for a write case configured to treat a
    /// closed channel as an error.
    fn try_invoke(&mut self) -> Result<bool, ChannelClosedError>;
}


/// Read operation on a [`Channel`](crate::Channel), usable with [`select`](crate::select())
///
/// The outcome is `Some(msg)`, or `None` if the channel was closed and drained.
pub struct ReadCase<T> {
    channel: core::Channel<T>,
    outcome: Option<Option<T>>,
    parked: Option<(u64, Arc<Slot<Option<T>>>)>,
}

impl<T> ReadCase<T> {
    pub(crate) fn new(channel: core::Channel<T>) -> Self {
        ReadCase { channel, outcome: None, parked: None }
    }

    /// Take the outcome, or error if the case is not ready
    ///
    /// Taking the outcome returns the case to the unset state.
    pub fn take_read(&mut self) -> Result<Option<T>, CaseNotReadyError> {
        self.outcome.take().ok_or(CaseNotReadyError)
    }

    /// Take the outcome
    ///
    /// Panics with [`CaseNotReadyError`] if the case is not ready.
    pub fn read(&mut self) -> Option<T> {
        self.take_read().unwrap_or_else(|e| panic!("{}", e))
    }
}

impl<T: Send> SelectCase for ReadCase<T> {
    fn reset(&mut self) {
        debug_assert!(self.parked.is_none(), "reset while parked (internal bug)");
        self.outcome = None;
    }

    fn is_ready(&self) -> bool {
        self.outcome.is_some()
    }

    fn try_invoke(&mut self) -> Result<bool, ChannelClosedError> {
        match self.channel.lock().try_read(None) {
            Attempt::Ready(outcome) => {
                self.outcome = Some(outcome);
                Ok(true)
            }
            Attempt::WouldBlock(()) | Attempt::Preempted(()) => Ok(false),
        }
    }
}

impl<T> sealed::Sealed for ReadCase<T> {
    fn register(&mut self, claim: &Arc<Claim>) -> Registration {
        let slot = Slot::new();
        match self.channel.lock().park_read(claim, &slot) {
            Parked::Ready(outcome) => {
                self.outcome = Some(outcome);
                Registration::Ready
            }
            Parked::Parked(id) => {
                self.parked = Some((id, slot));
                Registration::Parked
            }
            Parked::Preempted(()) => Registration::Preempted,
        }
    }

    fn poll_registration(&mut self) -> bool {
        let Some((_, slot)) = &self.parked else { return false };
        match slot.take() {
            Some(outcome) => {
                self.outcome = Some(outcome);
                self.parked = None;
                true
            }
            None => false,
        }
    }

    fn disconnect(&mut self) {
        let Some((id, slot)) = self.parked.take() else { return };
        let mut lock = self.channel.lock();
        if !lock.unpark_reader(id) {
            // completed after all. the slot was filled under the channel lock we now hold.
            if let Some(Some(msg)) = slot.take() {
                trace!("restoring element handed to retracted reader");
                lock.restore(msg);
            }
        }
    }

    fn thrown(&self) -> Result<(), ChannelClosedError> {
        Ok(())
    }
}

impl<T> Drop for ReadCase<T> {
    fn drop(&mut self) {
        sealed::Sealed::disconnect(self);
    }
}


/// Write operation on a [`Channel`](crate::Channel), usable with [`select`](crate::select())
///
/// The outcome is `true` if the payload was written, or `false` if the channel was closed. If
/// configured with `throw_on_closed`, a closed channel instead makes `select` and
/// [`try_invoke`](SelectCase::try_invoke) return [`ChannelClosedError`].
///
/// Each write sends a clone of the payload, so the case can be raced again after it wins. Use
/// [`rearm`](Self::rearm) to change the payload. A case whose payload was taken is never ready.
pub struct WriteCase<T> {
    channel: core::Channel<T>,
    payload: Option<T>,
    // clones the payload for each attempt. none for one-shot writes, which give it up instead.
    clone: Option<fn(&T) -> T>,
    throw_on_closed: bool,
    outcome: Option<bool>,
    parked: Option<(u64, Arc<Slot<WriteOutcome<T>>>)>,
}

impl<T> WriteCase<T> {
    pub(crate) fn new(
        channel: core::Channel<T>,
        msg: T,
        clone: Option<fn(&T) -> T>,
        throw_on_closed: bool,
    ) -> Self {
        WriteCase {
            channel,
            payload: Some(msg),
            clone,
            throw_on_closed,
            outcome: None,
            parked: None,
        }
    }

    /// Take the outcome, or error if the case is not ready
    pub fn take_written(&mut self) -> Result<bool, CaseNotReadyError> {
        self.outcome.take().ok_or(CaseNotReadyError)
    }

    /// Take the outcome
    ///
    /// Panics with [`CaseNotReadyError`] if the case is not ready.
    pub fn written(&mut self) -> bool {
        self.take_written().unwrap_or_else(|e| panic!("{}", e))
    }

    /// Install the payload for subsequent writes, returning the previous one
    pub fn rearm(&mut self, msg: T) -> Option<T> {
        self.payload.replace(msg)
    }

    /// Take back the payload, leaving the case unarmed
    pub fn take_payload(&mut self) -> Option<T> {
        self.payload.take()
    }

    // the element to attempt writing, if armed.
    fn take_msg(&mut self) -> Option<T> {
        match (self.clone, self.payload.as_ref()) {
            (Some(clone), Some(payload)) => Some(clone(payload)),
            _ => self.payload.take(),
        }
    }

    // an element that was not written. a cloned attempt is just dropped.
    fn put_back(&mut self, msg: T) {
        self.payload.get_or_insert(msg);
    }

    fn closed(&mut self, msg: T) -> Result<bool, ChannelClosedError> {
        self.put_back(msg);
        self.outcome = Some(false);
        if self.throw_on_closed {
            Err(ChannelClosedError)
        } else {
            Ok(true)
        }
    }
}

impl<T: Send> SelectCase for WriteCase<T> {
    fn reset(&mut self) {
        debug_assert!(self.parked.is_none(), "reset while parked (internal bug)");
        self.outcome = None;
    }

    fn is_ready(&self) -> bool {
        self.outcome.is_some()
    }

    fn try_invoke(&mut self) -> Result<bool, ChannelClosedError> {
        let Some(msg) = self.take_msg() else { return Ok(false) };
        let attempt = self.channel.lock().try_write(msg, None);
        match attempt {
            Attempt::Ready(Ok(())) => {
                self.outcome = Some(true);
                Ok(true)
            }
            Attempt::Ready(Err(msg)) => self.closed(msg),
            Attempt::WouldBlock(msg) | Attempt::Preempted(msg) => {
                self.put_back(msg);
                Ok(false)
            }
        }
    }
}

impl<T> sealed::Sealed for WriteCase<T> {
    fn register(&mut self, claim: &Arc<Claim>) -> Registration {
        let Some(msg) = self.take_msg() else { return Registration::Skipped };
        let slot = Slot::new();
        let parked = self.channel.lock().park_write(msg, claim, &slot);
        match parked {
            Parked::Ready(Ok(())) => {
                self.outcome = Some(true);
                Registration::Ready
            }
            Parked::Ready(Err(msg)) => {
                self.put_back(msg);
                self.outcome = Some(false);
                Registration::Ready
            }
            Parked::Parked(id) => {
                self.parked = Some((id, slot));
                Registration::Parked
            }
            Parked::Preempted(msg) => {
                self.put_back(msg);
                Registration::Preempted
            }
        }
    }

    fn poll_registration(&mut self) -> bool {
        let Some((_, slot)) = &self.parked else { return false };
        match slot.take() {
            Some(WriteOutcome::Written) => {
                self.outcome = Some(true);
            }
            Some(WriteOutcome::Closed(msg)) => {
                self.put_back(msg);
                self.outcome = Some(false);
            }
            Some(returned @ WriteOutcome::Returned(_)) => {
                // not a completion. leave it for disconnect.
                slot.fill(returned);
                return false;
            }
            None => return false,
        }
        self.parked = None;
        true
    }

    fn disconnect(&mut self) {
        let Some((id, slot)) = self.parked.take() else { return };
        let mut lock = self.channel.lock();
        if let Some(msg) = lock.unpark_writer(id) {
            drop(lock);
            self.put_back(msg);
            return;
        }
        drop(lock);
        match slot.take() {
            Some(WriteOutcome::Closed(msg)) | Some(WriteOutcome::Returned(msg)) => {
                self.put_back(msg);
            }
            Some(WriteOutcome::Written) => {
                trace!("retracted writer had already been consumed");
                self.outcome = Some(true);
            }
            None => (),
        }
    }

    fn thrown(&self) -> Result<(), ChannelClosedError> {
        if self.throw_on_closed && self.outcome == Some(false) {
            Err(ChannelClosedError)
        } else {
            Ok(())
        }
    }
}

impl<T> Drop for WriteCase<T> {
    fn drop(&mut self) {
        sealed::Sealed::disconnect(self);
    }
}
