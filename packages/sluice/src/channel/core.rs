// minimal safe API for the channel. the exposed API is a convenience wrapper around this.

use super::{
    ring_buffer::RingBuffer,
    waiter::{
        claim_ours,
        Claim,
        Pick,
        ReaderWaiter,
        Slot,
        WaiterList,
        WriteOutcome,
        WriterWaiter,
    },
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering::{Acquire, Release}},
        Arc,
        Mutex,
        MutexGuard,
    },
};


// handle to a channel.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

// channel shared state.
struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // buffer capacity. zero means unbuffered.
    capacity: usize,
    // mirrors Lockable.closed, for reading without locking. only ever set while locked.
    closed: AtomicBool,
    // process-wide sentinel channel. its closed state never changes and it can't be written to.
    frozen: bool,
}

// channel lockable state.
struct Lockable<T> {
    // buffered elements. none if unbuffered.
    buffer: Option<RingBuffer<T>>,
    // elements put back by abandoned readers that found no room in the buffer. read before the
    // buffer, and kept through close like it.
    restored: VecDeque<T>,
    // once true, never becomes false again. no writer is parked after this becomes true.
    closed: bool,
    // parked readers. only holds live waiters while nothing is buffered or restored and no
    // writer is live.
    readers: WaiterList<ReaderWaiter<T>>,
    // parked writers. only holds live waiters while the buffer is full and no reader is live.
    writers: WaiterList<WriterWaiter<T>>,
    // next waiter id.
    next_id: u64,
}

// result of attempting an operation without parking.
pub(crate) enum Attempt<O, P = ()> {
    // completed with the given outcome.
    Ready(O),
    // cannot complete without waiting.
    WouldBlock(P),
    // the operation's claim was already taken by some other channel.
    Preempted(P),
}

// result of attempting an operation, parking a waiter if it cannot complete.
pub(crate) enum Parked<O, P = ()> {
    // completed with the given outcome without parking.
    Ready(O),
    // a waiter with the given id was parked.
    Parked(u64),
    // the operation's claim was already taken by some other channel.
    Preempted(P),
}

impl<T> Channel<T> {
    // construct empty channel.
    pub(crate) fn new(capacity: usize) -> Self {
        Self::construct(capacity, false, false)
    }

    // construct unbuffered sentinel channel, which is either closed forever or never closed.
    pub(crate) fn sentinel(closed: bool) -> Self {
        Self::construct(0, closed, true)
    }

    fn construct(capacity: usize, closed: bool, frozen: bool) -> Self {
        Channel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                buffer: (capacity > 0).then(|| RingBuffer::new(capacity)),
                restored: VecDeque::new(),
                closed,
                readers: WaiterList::new(),
                writers: WaiterList::new(),
                next_id: 0,
            }),
            capacity,
            closed: AtomicBool::new(closed),
            frozen,
        }))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.0.capacity
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Acquire)
    }

    // whether two handles refer to the same channel.
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // lock the channel.
    pub(crate) fn lock(&self) -> Lock<'_, T> {
        Lock {
            shared: &self.0,
            lock: self.0.lockable.lock().unwrap(),
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }
}

// lock on a channel.
pub(crate) struct Lock<'a, T> {
    shared: &'a Arc<Shared<T>>,
    lock: MutexGuard<'a, Lockable<T>>,
}

impl<'a, T> Lock<'a, T> {
    // number of buffered elements, including restored ones.
    pub(crate) fn len(&self) -> usize {
        self.lock.buffer.as_ref().map_or(0, RingBuffer::len) + self.lock.restored.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.lock.next_id;
        self.lock.next_id += 1;
        id
    }

    // try to read without parking, on behalf of the operation owning `ours`.
    //
    // resolves to `Some(elem)`, or `None` if closed and drained.
    pub(crate) fn try_read(&mut self, ours: Option<&Claim>) -> Attempt<Option<T>> {
        let lockable = &mut *self.lock;

        if !lockable.restored.is_empty() {
            if !claim_ours(ours) {
                return Attempt::Preempted(());
            }
            return Attempt::Ready(lockable.restored.pop_front());
        }

        // buffered elements come first, even after close
        if lockable.buffer.as_ref().is_some_and(|buf| !buf.is_empty()) {
            if !claim_ours(ours) {
                return Attempt::Preempted(());
            }
            let elem = lockable.buffer.as_mut().and_then(RingBuffer::pop);
            // a slot just freed up, so one parked writer can move its element into it
            if let Pick::Claimed(writer) = lockable.writers.pick(None) {
                let msg = writer.accept();
                if let Some(buf) = lockable.buffer.as_mut() {
                    assert!(buf.push(msg).is_ok(), "buffer full after pop (internal bug)");
                }
                trace!("admitted parked writer into freed buffer slot");
            }
            return Attempt::Ready(elem);
        }

        if lockable.closed {
            if !claim_ours(ours) {
                return Attempt::Preempted(());
            }
            return Attempt::Ready(None);
        }
        if self.shared.frozen {
            return Attempt::WouldBlock(());
        }

        // unbuffered handoff directly from a parked writer
        match lockable.writers.pick(ours) {
            Pick::Claimed(writer) => {
                trace!("took element directly from parked writer");
                Attempt::Ready(Some(writer.accept()))
            }
            Pick::OursTaken => Attempt::Preempted(()),
            Pick::Empty => Attempt::WouldBlock(()),
        }
    }

    // try to read, otherwise park a reader that will be completed through `slot`.
    pub(crate) fn park_read(
        &mut self,
        claim: &Arc<Claim>,
        slot: &Arc<Slot<Option<T>>>,
    ) -> Parked<Option<T>> {
        match self.try_read(Some(claim.as_ref())) {
            Attempt::Ready(outcome) => Parked::Ready(outcome),
            Attempt::Preempted(()) => Parked::Preempted(()),
            Attempt::WouldBlock(()) => {
                // readers claimed elsewhere hold nothing worth keeping
                drop(self.lock.readers.sweep_claimed());
                let id = self.next_id();
                self.lock.readers.push(ReaderWaiter {
                    id,
                    claim: Arc::clone(claim),
                    slot: Arc::clone(slot),
                });
                Parked::Parked(id)
            }
        }
    }

    // try to write without parking, on behalf of the operation owning `ours`.
    //
    // resolves to ok if written, or err with the element if closed.
    pub(crate) fn try_write(&mut self, msg: T, ours: Option<&Claim>) -> Attempt<Result<(), T>, T> {
        let lockable = &mut *self.lock;

        if lockable.closed {
            if !claim_ours(ours) {
                return Attempt::Preempted(msg);
            }
            return Attempt::Ready(Err(msg));
        }
        if self.shared.frozen {
            return Attempt::WouldBlock(msg);
        }

        // unbuffered handoff directly to a parked reader
        match lockable.readers.pick(ours) {
            Pick::Claimed(reader) => {
                trace!("handed element directly to parked reader");
                reader.complete(Some(msg));
                return Attempt::Ready(Ok(()));
            }
            Pick::OursTaken => return Attempt::Preempted(msg),
            Pick::Empty => (),
        }

        match lockable.buffer.as_mut() {
            Some(buf) if !buf.is_full() => {
                if !claim_ours(ours) {
                    return Attempt::Preempted(msg);
                }
                assert!(buf.push(msg).is_ok(), "buffer full after check (internal bug)");
                Attempt::Ready(Ok(()))
            }
            _ => Attempt::WouldBlock(msg),
        }
    }

    // try to write, otherwise park a writer that will be completed through `slot`.
    pub(crate) fn park_write(
        &mut self,
        msg: T,
        claim: &Arc<Claim>,
        slot: &Arc<Slot<WriteOutcome<T>>>,
    ) -> Parked<Result<(), T>, T> {
        match self.try_write(msg, Some(claim.as_ref())) {
            Attempt::Ready(outcome) => Parked::Ready(outcome),
            Attempt::Preempted(msg) => Parked::Preempted(msg),
            Attempt::WouldBlock(msg) => {
                let id = self.next_id();
                self.lock.writers.push(WriterWaiter {
                    id,
                    claim: Arc::clone(claim),
                    msg,
                    slot: Arc::clone(slot),
                });
                Parked::Parked(id)
            }
        }
    }

    // remove a parked reader, if still parked.
    pub(crate) fn unpark_reader(&mut self, id: u64) -> bool {
        self.lock.readers.remove(id).is_some()
    }

    // remove a parked writer, if still parked, handing back its element.
    pub(crate) fn unpark_writer(&mut self, id: u64) -> Option<T> {
        self.lock.writers.remove(id).map(|writer| writer.msg)
    }

    // close the channel. returns false if already closed.
    //
    // completes all parked readers with `None` and all parked writers with failure. buffered
    // elements are kept.
    pub(crate) fn close(&mut self) -> bool {
        if self.lock.closed || self.shared.frozen {
            return false;
        }
        self.lock.closed = true;
        self.shared.closed.store(true, Release);

        let readers = self.lock.readers.drain();
        let writers = self.lock.writers.drain();
        trace!(readers = readers.len(), writers = writers.len(), "closing channel");
        for reader in readers {
            if reader.claim.try_claim() {
                reader.complete(None);
            }
        }
        for writer in writers {
            if writer.claim.try_claim() {
                writer.reject();
            } else {
                // claimed by a select that won elsewhere. leave the element in the slot for the
                // select to recover when it disconnects this case, without waking anyone.
                writer.slot.fill(WriteOutcome::Returned(writer.msg));
            }
        }
        true
    }

    // put back an element that was handed to a reader which was dropped before observing it.
    //
    // the element goes to another parked reader, else into the buffer, else into the restored
    // queue. it is never dropped, even if the channel has closed since.
    pub(crate) fn restore(&mut self, msg: T) {
        let msg = match self.try_write(msg, None) {
            Attempt::Ready(Ok(())) => return,
            Attempt::Ready(Err(msg)) | Attempt::WouldBlock(msg) | Attempt::Preempted(msg) => msg,
        };
        let msg = match self.lock.buffer.as_mut() {
            Some(buf) => match buf.push(msg) {
                Ok(()) => return,
                Err(msg) => msg,
            },
            None => msg,
        };
        trace!("queueing restored element");
        self.lock.restored.push_back(msg);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn ready<O, P>(attempt: Attempt<O, P>) -> O {
        match attempt {
            Attempt::Ready(outcome) => outcome,
            _ => panic!("expected ready"),
        }
    }

    #[test]
    fn buffered_elements_survive_close() {
        let channel = Channel::new(2);
        let mut lock = channel.lock();
        assert!(ready(lock.try_write(1, None)).is_ok());
        assert!(ready(lock.try_write(2, None)).is_ok());
        assert!(matches!(lock.try_write(3, None), Attempt::WouldBlock(3)));
        assert!(lock.close());
        assert!(!lock.close());
        assert!(matches!(lock.try_write(4, None), Attempt::Ready(Err(4))));
        assert_eq!(ready(lock.try_read(None)), Some(1));
        assert_eq!(ready(lock.try_read(None)), Some(2));
        assert_eq!(ready(lock.try_read(None)), None);
        drop(lock);
        assert!(channel.is_closed());
    }

    #[test]
    fn pop_admits_parked_writer() {
        let channel = Channel::new(1);
        let mut lock = channel.lock();
        assert!(ready(lock.try_write('a', None)).is_ok());
        let claim = Claim::new();
        let slot = Slot::new();
        assert!(matches!(lock.park_write('b', &claim, &slot), Parked::Parked(_)));
        assert_eq!(ready(lock.try_read(None)), Some('a'));
        assert!(matches!(slot.take(), Some(WriteOutcome::Written)));
        assert_eq!(lock.len(), 1);
        assert_eq!(ready(lock.try_read(None)), Some('b'));
    }

    #[test]
    fn unbuffered_handoff_to_parked_reader() {
        let channel = Channel::new(0);
        let mut lock = channel.lock();
        assert!(matches!(lock.try_write(5, None), Attempt::WouldBlock(5)));
        let claim = Claim::new();
        let slot = Slot::new();
        assert!(matches!(lock.park_read(&claim, &slot), Parked::Parked(_)));
        assert!(ready(lock.try_write(5, None)).is_ok());
        assert_eq!(slot.take(), Some(Some(5)));
        assert!(claim.is_claimed());
    }

    #[test]
    fn close_completes_parked_waiters() {
        let channel = Channel::<&str>::new(0);
        let mut lock = channel.lock();
        let read_claim = Claim::new();
        let read_slot = Slot::new();
        lock.park_read(&read_claim, &read_slot);
        drop(lock);

        let other = Channel::new(0);
        let mut lock = other.lock();
        let write_claim = Claim::new();
        let write_slot = Slot::new();
        lock.park_write("x", &write_claim, &write_slot);
        assert!(lock.close());
        drop(lock);

        assert!(channel.lock().close());
        assert_eq!(read_slot.take(), Some(None));
        assert!(matches!(write_slot.take(), Some(WriteOutcome::Closed("x"))));
    }

    #[test]
    fn shared_claim_completes_only_once() {
        // one claim parked on two channels, as a select would
        let a = Channel::new(0);
        let b = Channel::new(0);
        let claim = Claim::new();
        let slot_a = Slot::new();
        let slot_b = Slot::new();
        let Parked::Parked(id_b) = b.lock().park_read(&claim, &slot_b) else { panic!() };
        assert!(matches!(a.lock().park_read(&claim, &slot_a), Parked::Parked(_)));
        assert!(ready(a.lock().try_write(1, None)).is_ok());
        // b's reader is stale now, so a write to b cannot complete
        assert!(matches!(b.lock().try_write(2, None), Attempt::WouldBlock(2)));
        assert_eq!(slot_a.take(), Some(Some(1)));
        assert!(slot_b.take().is_none());
        assert!(b.lock().unpark_reader(id_b));
    }

    #[test]
    fn stale_parked_writer_keeps_element_through_close() {
        let channel = Channel::new(0);
        let claim = Claim::new();
        let slot = Slot::new();
        let Parked::Parked(id) = channel.lock().park_write(9, &claim, &slot) else { panic!() };
        assert!(claim.try_claim());
        assert!(channel.lock().close());
        assert_eq!(channel.lock().unpark_writer(id), None);
        assert!(matches!(slot.take(), Some(WriteOutcome::Returned(9))));
    }

    #[test]
    fn restore_prefers_readers_then_buffer_then_queue() {
        let channel = Channel::new(0);
        let claim = Claim::new();
        let slot = Slot::new();
        assert!(matches!(channel.lock().park_read(&claim, &slot), Parked::Parked(_)));
        channel.lock().restore(0);
        assert_eq!(slot.take(), Some(Some(0)));

        channel.lock().restore(1);
        assert_eq!(channel.lock().len(), 1);
        assert_eq!(ready(channel.lock().try_read(None)), Some(1));

        let buffered = Channel::new(1);
        buffered.lock().restore(2);
        assert_eq!(buffered.lock().len(), 1);
        buffered.lock().close();
        buffered.lock().restore(3);
        assert_eq!(buffered.lock().len(), 2);
        assert_eq!(ready(buffered.lock().try_read(None)), Some(3));
        assert_eq!(ready(buffered.lock().try_read(None)), Some(2));
        assert_eq!(ready(buffered.lock().try_read(None)), None);
    }

    #[test]
    fn sentinels_are_frozen() {
        let never = Channel::<()>::sentinel(false);
        let claim = Claim::new();
        let slot = Slot::new();
        assert!(matches!(never.lock().park_read(&claim, &slot), Parked::Parked(_)));
        // not even a parked reader makes the never channel writable
        assert!(matches!(never.lock().try_write((), None), Attempt::WouldBlock(())));
        assert!(!never.lock().close());
        assert!(!never.is_closed());
        assert!(slot.take().is_none());

        let closed = Channel::<()>::sentinel(true);
        assert!(closed.is_closed());
        assert!(!closed.lock().close());
        assert_eq!(ready(closed.lock().try_read(None)), None);
    }
}
