// pending reader / writer records part of a channel.
//
// a waiter is parked in a channel's reader or writer list while its operation cannot complete.
// each waiter points at a `Claim` shared by every waiter of the same logical operation: a lone
// read or write has a claim of its own, while all cases registered by one `select` share a
// single claim. a waiter may only be completed by whoever first claims its claim, which is what
// makes a select complete at most one of its cases even if several channels become ready at
// once.
//
// the outcome of a completed waiter is written into a `Slot` which the owning future polls.
//
// lock order: channel lock, then claim lock. a claim lock is never held while acquiring any
// other lock.

use crate::util::random::random_to_back;
use std::{
    sync::{Arc, Mutex},
    task::Waker,
};


// claim token of one pending operation.
pub struct Claim(Mutex<ClaimState>);

struct ClaimState {
    claimed: bool,
    waker: Option<Waker>,
}

// result of trying to claim a waiter on behalf of another operation.
pub(crate) enum Pick<W> {
    // the waiter was claimed and removed from its list.
    Claimed(W),
    // the claim of the operation doing the picking was already taken.
    OursTaken,
    // no waiter in the list could be claimed.
    Empty,
}

impl Claim {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Claim(Mutex::new(ClaimState { claimed: false, waker: None })))
    }

    // claim if unclaimed. returns whether this call claimed it.
    pub(crate) fn try_claim(&self) -> bool {
        let mut lock = self.0.lock().unwrap();
        !std::mem::replace(&mut lock.claimed, true)
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.0.lock().unwrap().claimed
    }

    // install the waker to wake once a waiter holding this claim is completed.
    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut lock = self.0.lock().unwrap();
        match &lock.waker {
            Some(prev) if prev.will_wake(waker) => (),
            _ => lock.waker = Some(waker.clone()),
        }
    }

    pub(crate) fn wake(&self) {
        let waker = self.0.lock().unwrap().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// atomically claim both `ours` and `theirs`, or neither.
//
// an operation can never be matched against a waiter sharing its own claim (a select reading and
// writing the same channel), which is reported as `theirs` being unavailable.
fn claim_both(ours: &Claim, theirs: &Claim) -> Result<(), Taken> {
    if std::ptr::eq(ours, theirs) {
        return Err(Taken::Theirs);
    }
    // lock in address order so that two operations claiming each other can't deadlock
    let ours_first = (ours as *const Claim) < (theirs as *const Claim);
    let (first, second) = if ours_first { (ours, theirs) } else { (theirs, ours) };
    let mut lock_1 = first.0.lock().unwrap();
    let mut lock_2 = second.0.lock().unwrap();
    let (ours_lock, theirs_lock) =
        if ours_first { (&mut lock_1, &mut lock_2) } else { (&mut lock_2, &mut lock_1) };
    if ours_lock.claimed {
        return Err(Taken::Ours);
    }
    if theirs_lock.claimed {
        return Err(Taken::Theirs);
    }
    ours_lock.claimed = true;
    theirs_lock.claimed = true;
    Ok(())
}

enum Taken {
    Ours,
    Theirs,
}

// claim `ours`, if there is one. operations that are not racing anything pass `None`.
pub(crate) fn claim_ours(ours: Option<&Claim>) -> bool {
    ours.map_or(true, Claim::try_claim)
}


// outcome delivery slot shared between a parked waiter and the future that owns it.
pub(crate) struct Slot<O>(Mutex<Option<O>>);

impl<O> Slot<O> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Slot(Mutex::new(None)))
    }

    pub(crate) fn fill(&self, outcome: O) {
        let mut lock = self.0.lock().unwrap();
        assert!(lock.is_none(), "waiter completed twice (internal bug)");
        *lock = Some(outcome);
    }

    pub(crate) fn take(&self) -> Option<O> {
        self.0.lock().unwrap().take()
    }
}


// parked reader. completed with `Some(value)`, or `None` if the channel closes.
pub(crate) struct ReaderWaiter<T> {
    pub(crate) id: u64,
    pub(crate) claim: Arc<Claim>,
    pub(crate) slot: Arc<Slot<Option<T>>>,
}

// outcome of a parked writer.
pub(crate) enum WriteOutcome<T> {
    // the value was taken by a reader or moved into the buffer.
    Written,
    // the channel closed first. the value is handed back.
    Closed(T),
    // the channel closed while the waiter was claimed by some other channel. not a completion:
    // the value is only parked here until the owner disconnects.
    Returned(T),
}

// parked writer, holding the value it is trying to write.
pub(crate) struct WriterWaiter<T> {
    pub(crate) id: u64,
    pub(crate) claim: Arc<Claim>,
    pub(crate) msg: T,
    pub(crate) slot: Arc<Slot<WriteOutcome<T>>>,
}

impl<T> ReaderWaiter<T> {
    // complete a claimed reader.
    pub(crate) fn complete(self, outcome: Option<T>) {
        self.slot.fill(outcome);
        self.claim.wake();
    }
}

impl<T> WriterWaiter<T> {
    // complete a claimed writer successfully, taking its value.
    pub(crate) fn accept(self) -> T {
        self.slot.fill(WriteOutcome::Written);
        self.claim.wake();
        self.msg
    }

    // complete a claimed writer with failure, handing its value back.
    pub(crate) fn reject(self) {
        self.slot.fill(WriteOutcome::Closed(self.msg));
        self.claim.wake();
    }
}

// common part of reader and writer waiters.
pub(crate) trait Waiter {
    fn id(&self) -> u64;
    fn claim(&self) -> &Claim;
}

impl<T> Waiter for ReaderWaiter<T> {
    fn id(&self) -> u64 { self.id }
    fn claim(&self) -> &Claim { &self.claim }
}

impl<T> Waiter for WriterWaiter<T> {
    fn id(&self) -> u64 { self.id }
    fn claim(&self) -> &Claim { &self.claim }
}


// unordered list of parked waiters.
//
// a waiter whose claim was taken by some other channel stays listed until its owner disconnects
// it. such a waiter is skipped by `pick`, and may linger briefly, so "the list is non-empty"
// does not imply "some waiter is live".
pub(crate) struct WaiterList<W>(Vec<W>);

impl<W: Waiter> WaiterList<W> {
    pub(crate) fn new() -> Self {
        WaiterList(Vec::new())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn push(&mut self, waiter: W) {
        self.0.push(waiter);
    }

    // remove the waiter with the given id, if still listed.
    pub(crate) fn remove(&mut self, id: u64) -> Option<W> {
        let idx = self.0.iter().position(|w| w.id() == id)?;
        Some(self.0.swap_remove(idx))
    }

    // remove all waiters.
    pub(crate) fn drain(&mut self) -> Vec<W> {
        std::mem::take(&mut self.0)
    }

    // claim and remove a uniformly random waiter among those still claimable, on behalf of the
    // operation owning `ours` (claimed together with the waiter).
    pub(crate) fn pick(&mut self, ours: Option<&Claim>) -> Pick<W> {
        // candidates are self.0[..n]; rejected waiters are rotated behind them
        let mut n = self.0.len();
        while n > 0 {
            random_to_back(&mut self.0[..n]);
            let theirs = self.0[n - 1].claim();
            let claimed = match ours {
                Some(ours) => match claim_both(ours, theirs) {
                    Ok(()) => true,
                    Err(Taken::Ours) => return Pick::OursTaken,
                    Err(Taken::Theirs) => false,
                },
                None => theirs.try_claim(),
            };
            if claimed {
                return Pick::Claimed(self.0.swap_remove(n - 1));
            }
            n -= 1;
        }
        Pick::Empty
    }

    // remove waiters whose claim has been taken elsewhere, returning them.
    pub(crate) fn sweep_claimed(&mut self) -> Vec<W> {
        let mut swept = Vec::new();
        let mut i = 0;
        while i < self.0.len() {
            if self.0[i].claim().is_claimed() {
                swept.push(self.0.swap_remove(i));
            } else {
                i += 1;
            }
        }
        swept
    }
}
