// spawned tokio task owned by a timer, context deadline, or ticker.

use std::future::Future;
use tokio::task::{
    spawn,
    AbortHandle,
};


// handle to a spawned task that aborts the task if dropped.
//
// context deadlines and the time helpers keep one of these per armed timeout. taking it out of
// its owner and dropping it is how a timeout is cleared, so clearing happens exactly once.
pub(crate) struct AbortOnDrop(AbortHandle);

impl AbortOnDrop {
    // spawn a task onto the current tokio runtime and take ownership of it.
    //
    // panics if called outside a tokio runtime.
    pub(crate) fn spawn<F>(f: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        AbortOnDrop(spawn(f).abort_handle())
    }

    // abort the task without giving up the handle.
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
