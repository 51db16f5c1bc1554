// implementation of the sluice channel.
//
// the basic architecture is as such:
//
// channel handles wrap around Arc<Mutex<lockable state>>
//                                         |
//          /------------------------------/
//          v
//       lockable state
//          |
//          |------ it contains a ring_buffer::RingBuffer<T>, a fixed-capacity circular queue
//          |       holding the buffered elements. unbuffered channels have none.
//          |
//          |------ it contains a list of parked writers:
//          |
//          |       each corresponds to a pending write future or a select write case which could
//          |       not complete immediately. it holds the element it is trying to write, a claim
//          |       token, and a slot its outcome is delivered into. when several are waiting, the
//          |       one to complete next is chosen at random.
//          |
//          \------ it contains a list of parked readers, which is the same idea for reads.
//
// a claim token is shared by every waiter of one logical operation, so that a select parked on
// several channels at once completes at most one of them. completing a waiter means claiming its
// token first, which happens under the lock of the channel completing it.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      ring_buffer<-----------core: This presents an abstraction for channels which is fully
//                   |         ^     safe, but which requires its caller to drive waiters through
//      waiter<------/         |     parking, polling, and retracting by hand.
//                             |
//      select::case<----------api: This is a wrapper around core that adapts it into an API that
//                                  is convenient and hard to misuse. The crate re-exports this
//                                  API publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod waiter;

mod ring_buffer;
