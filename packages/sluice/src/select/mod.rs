//! Racing several channel operations.

pub(crate) mod case;

use self::case::{Registration, SelectCase};
use crate::{
    channel::waiter::Claim,
    error::ChannelClosedError,
    util::random::shuffle,
};
use smallvec::SmallVec;
use std::{
    future::Future,
    mem::replace,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};


// case indices in visiting order. most selects have few cases.
type Order = SmallVec<[usize; 8]>;

/// Result of a [`select`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Selected {
    /// The case at this index of the list passed to `select` completed
    Case(usize),
    /// No case was ready and a default was requested
    Default,
}

/// Race the given cases, completing exactly one of them
///
/// If several cases can complete immediately, one is chosen uniformly at random. Otherwise, if
/// `has_default` is true, resolves to [`Selected::Default`] on first poll without completing
/// anything. Otherwise, waits for the first case to become ready and retracts the rest.
///
/// Every case is [`reset`](SelectCase::reset) first. The winning case holds the outcome of its
/// operation. With no cases and no default, the returned future never resolves.
///
/// Resolves to [`ChannelClosedError`] if the chosen case is a [`WriteCase`](crate::WriteCase)
/// configured with `throw_on_closed` whose channel is closed.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use sluice::{select, Channel, Selected};
///
/// let numbers = Channel::<u32>::new(1);
/// let words = Channel::<&str>::new(1);
/// words.try_write("hi").unwrap();
///
/// let mut read_numbers = numbers.read_case();
/// let mut read_words = words.read_case();
/// let selected = select(&mut [&mut read_numbers, &mut read_words], false).await.unwrap();
/// assert_eq!(selected, Selected::Case(1));
/// assert_eq!(read_words.read(), Some("hi"));
/// # }
/// ```
pub fn select<'a, 'b>(
    cases: &'a mut [&'b mut dyn SelectCase],
    has_default: bool,
) -> SelectFut<'a, 'b> {
    SelectFut { cases, has_default, state: State::Start }
}

/// Non-blocking [`select`]: complete one ready case, or return `None` if none are ready
pub fn try_select(cases: &mut [&mut dyn SelectCase]) -> Result<Option<usize>, ChannelClosedError> {
    let (_, ready) = scan(cases)?;
    Ok(ready)
}

// shuffle, reset, and try every case in the shuffled order. returns the order, and the first
// case to complete.
fn scan(cases: &mut [&mut dyn SelectCase]) -> Result<(Order, Option<usize>), ChannelClosedError> {
    let mut order: Order = (0..cases.len()).collect();
    shuffle(&mut order);
    for &i in &order {
        cases[i].reset();
    }
    for &i in &order {
        if cases[i].try_invoke()? {
            return Ok((order, Some(i)));
        }
    }
    Ok((order, None))
}

/// Future for [`select`]
///
/// Dropping this future before it resolves retracts all of its registrations. If a case was
/// completed concurrently but not yet observed, a read element is put back into its channel.
pub struct SelectFut<'a, 'b> {
    cases: &'a mut [&'b mut dyn SelectCase],
    has_default: bool,
    state: State,
}

enum State {
    // not yet polled.
    Start,
    // waiters parked for these cases, all holding the claim.
    Parked { claim: Arc<Claim>, parked: Order },
    // no cases and no default.
    Never,
    // resolved.
    Done,
}

impl<'a, 'b> SelectFut<'a, 'b> {
    // first poll: steps up to and including registration.
    fn start(&mut self, cx: &mut Context) -> Option<Result<Selected, ChannelClosedError>> {
        if self.cases.is_empty() && !self.has_default {
            self.state = State::Never;
            return None;
        }
        let order = match scan(self.cases) {
            Ok((_, Some(i))) => return Some(Ok(Selected::Case(i))),
            Ok((order, None)) => order,
            Err(e) => return Some(Err(e)),
        };
        if self.has_default {
            return Some(Ok(Selected::Default));
        }

        let claim = Claim::new();
        claim.set_waker(cx.waker());
        let mut parked = Order::new();
        for &i in &order {
            match self.cases[i].register(&claim) {
                Registration::Parked => parked.push(i),
                Registration::Ready => {
                    for &j in &parked {
                        self.cases[j].disconnect();
                    }
                    return Some(self.resolve(i));
                }
                // some earlier parked case already won
                Registration::Preempted => break,
                Registration::Skipped => (),
            }
        }
        trace!(cases = parked.len(), "select parked");
        self.state = State::Parked { claim, parked };
        None
    }

    // check parked cases for a winner, retracting the rest if found.
    fn poll_parked(&mut self) -> Option<Result<Selected, ChannelClosedError>> {
        let State::Parked { claim, parked } = replace(&mut self.state, State::Done) else {
            unreachable!("poll_parked while not parked")
        };
        let winner = parked.iter().copied().find(|&i| self.cases[i].poll_registration());
        match winner {
            Some(i) => {
                for &j in parked.iter().filter(|&&j| j != i) {
                    self.cases[j].disconnect();
                }
                trace!("select resolved");
                Some(self.resolve(i))
            }
            None => {
                self.state = State::Parked { claim, parked };
                None
            }
        }
    }

    fn resolve(&self, i: usize) -> Result<Selected, ChannelClosedError> {
        self.cases[i].thrown().map(|()| Selected::Case(i))
    }
}

impl Future for SelectFut<'_, '_> {
    type Output = Result<Selected, ChannelClosedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.state {
            State::Start => {
                if let Some(output) = this.start(cx) {
                    this.state = State::Done;
                    return Poll::Ready(output);
                }
                if !matches!(&this.state, State::Parked { .. }) {
                    return Poll::Pending;
                }
            }
            State::Parked { ref claim, .. } => claim.set_waker(cx.waker()),
            State::Never | State::Done => return Poll::Pending,
        }
        match this.poll_parked() {
            Some(output) => Poll::Ready(output),
            None => Poll::Pending,
        }
    }
}

#[cfg(feature = "futures")]
impl futures::future::FusedFuture for SelectFut<'_, '_> {
    fn is_terminated(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

impl Drop for SelectFut<'_, '_> {
    fn drop(&mut self) {
        if let State::Parked { claim, parked } = replace(&mut self.state, State::Done) {
            // take the claim first so no channel can complete a case while we retract them
            claim.try_claim();
            for i in parked {
                self.cases[i].disconnect();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, ReadCase, WriteCase};
    use futures::FutureExt;
    use std::time::Duration;

    #[tokio::test]
    async fn default_resolves_synchronously() {
        let channel = Channel::<u8>::new(0);
        let mut case = channel.read_case();
        let selected = select(&mut [&mut case], true)
            .now_or_never()
            .expect("select with default suspended");
        assert_eq!(selected, Ok(Selected::Default));
        assert!(!case.is_ready());
    }

    #[tokio::test]
    async fn ready_case_wins_synchronously() {
        let a = Channel::<u8>::new(1);
        let b = Channel::<u8>::new(1);
        b.try_write(7).unwrap();
        let mut read_a = a.read_case();
        let mut read_b = b.read_case();
        let selected = select(&mut [&mut read_a, &mut read_b], false)
            .now_or_never()
            .expect("ready select suspended");
        assert_eq!(selected, Ok(Selected::Case(1)));
        assert_eq!(read_b.read(), Some(7));
        assert!(read_a.take_read().is_err());
    }

    #[test]
    fn fair_between_simultaneously_ready_cases() {
        let a = Channel::<u32>::new(1);
        let b = Channel::<u32>::new(1);
        let mut read_a = a.read_case();
        let mut read_b = b.read_case();
        let mut wins = [0u32; 2];
        for _ in 0..1000 {
            let _ = a.try_write(0);
            let _ = b.try_write(1);
            let i = try_select(&mut [&mut read_a, &mut read_b]).unwrap().unwrap();
            wins[i] += 1;
        }
        assert!(wins[0] >= 300 && wins[1] >= 300, "{:?}", wins);
    }

    #[tokio::test]
    async fn empty_select_never_resolves() {
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            select(&mut [], false),
        ).await;
        assert!(result.is_err());
        assert_eq!(try_select(&mut []), Ok(None));
    }

    #[tokio::test]
    async fn parked_select_wakes_on_write_and_retracts_losers() {
        let a = Channel::<u32>::new(0);
        let b = Channel::<u32>::new(0);
        let writer = {
            let b = b.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                b.write(5).await.unwrap();
            })
        };
        let mut read_a = a.read_case();
        let mut read_b = b.read_case();
        let selected = select(&mut [&mut read_a, &mut read_b], false).await;
        assert_eq!(selected, Ok(Selected::Case(1)));
        assert_eq!(read_b.read(), Some(5));
        writer.await.unwrap();
        // the losing reader on `a` was retracted, so nothing can hand off to it
        assert!(a.try_write(1).unwrap_err().is_would_block());
    }

    #[tokio::test]
    async fn write_case_wins_against_parked_reader() {
        let channel = Channel::<String>::new(0);
        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.read().await })
        };
        tokio::task::yield_now().await;
        let idle = Channel::<String>::new(0);
        let mut write = channel.write_case("hello".to_owned(), false);
        let mut read_idle: ReadCase<String> = idle.read_case();
        let selected = select(&mut [&mut read_idle, &mut write], false).await;
        assert_eq!(selected, Ok(Selected::Case(1)));
        assert!(write.written());
        // the case keeps its payload for the next select
        assert_eq!(write.take_payload(), Some("hello".to_owned()));
        assert_eq!(reader.await.unwrap(), Some("hello".to_owned()));
    }

    #[tokio::test]
    async fn losing_write_case_keeps_payload() {
        let full = Channel::<u32>::new(0);
        let ready = Channel::<u32>::new(1);
        ready.try_write(1).unwrap();
        let mut write: WriteCase<u32> = full.write_case(42, false);
        let mut read = ready.read_case();
        for _ in 0..20 {
            let selected = select(&mut [&mut write, &mut read], false).await;
            assert_eq!(selected, Ok(Selected::Case(1)));
            assert_eq!(read.read(), Some(1));
            ready.try_write(1).unwrap();
        }
        assert_eq!(write.take_payload(), Some(42));
    }

    #[tokio::test]
    async fn closed_write_case_is_ready_or_throws() {
        let channel = Channel::<u32>::new(0);
        channel.close();
        let mut lenient = channel.write_case(1, false);
        assert_eq!(select(&mut [&mut lenient], false).await, Ok(Selected::Case(0)));
        assert!(!lenient.written());
        assert_eq!(lenient.take_payload(), Some(1));

        let mut strict = channel.write_case(2, true);
        assert_eq!(select(&mut [&mut strict], false).await, Err(ChannelClosedError));
    }

    #[tokio::test]
    async fn parked_strict_write_throws_when_channel_closes() {
        let channel = Channel::<u32>::new(0);
        let closer = {
            let channel = channel.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                channel.close();
            })
        };
        let idle = Channel::<u32>::new(0);
        let mut strict = channel.write_case(3, true);
        let mut read_idle = idle.read_case();
        let result = select(&mut [&mut strict, &mut read_idle], false).await;
        assert_eq!(result, Err(ChannelClosedError));
        assert_eq!(strict.take_payload(), Some(3));
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_select_retracts_registrations() {
        let a = Channel::<u32>::new(0);
        let mut read_a = a.read_case();
        {
            let mut cases: [&mut dyn SelectCase; 1] = [&mut read_a];
            let fut = select(&mut cases, false);
            assert!(fut.now_or_never().is_none());
        }
        assert!(a.try_write(1).unwrap_err().is_would_block());
    }

    #[tokio::test]
    async fn read_and_write_on_same_channel_never_match_each_other() {
        let channel = Channel::<u32>::new(0);
        let mut read = channel.read_case();
        let mut write = channel.write_case(1, false);
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            select(&mut [&mut read, &mut write], false),
        ).await;
        assert!(result.is_err());
        assert_eq!(write.take_payload(), Some(1));
    }
}
