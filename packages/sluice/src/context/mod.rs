//! Hierarchical cancellation contexts.
//!
//! A [`Context`] carries a cancellation signal, an optional deadline, and request-scoped
//! values down a tree of operations. Cancelling a context cancels all of its descendants with
//! the same [`ContextError`], and closes each of their [`done`](Context::done) channels.

mod error;

pub use self::error::ContextError;

use crate::{
    future::ReadFut,
    select,
    util::abort_on_drop::AbortOnDrop,
    Channel,
    Selected,
};
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
        Mutex,
        OnceLock,
    },
    time::Duration,
};
use tokio::time::Instant;


/// Type-level key for values stored in a [`Context`]
///
/// Keys are compared by type, so two distinct key types never collide even if their values
/// have the same type.
///
/// ```
/// use sluice::ContextKey;
///
/// struct RequestId;
///
/// impl ContextKey for RequestId {
///     type Value = u64;
/// }
///
/// let ctx = sluice::background().with_value::<RequestId>(7);
/// assert_eq!(ctx.value::<RequestId>(), Some(&7));
/// ```
pub trait ContextKey: 'static {
    /// Type of the value bound to this key
    type Value: Send + Sync + 'static;
}

/// Node in a tree of cancellation contexts
///
/// Cheap to clone. Contexts are immutable once created, other than becoming cancelled.
#[derive(Clone)]
pub struct Context(Arc<Node>);

struct Node {
    // unique per node, keys the child set of the nearest cancelable ancestor
    id: u64,
    kind: Kind,
}

enum Kind {
    // root. never cancelled itself.
    Empty {
        name: &'static str,
        done: Channel<()>,
    },
    // single key / value binding. everything else delegates to the parent.
    Value {
        parent: Context,
        key: TypeId,
        key_name: &'static str,
        value: Box<dyn Any + Send + Sync>,
    },
    // cancelled explicitly or by an ancestor.
    Cancel {
        parent: Context,
        cancel: Cancel,
    },
    // additionally cancelled once the deadline passes.
    Timer {
        parent: Context,
        deadline: Instant,
        cancel: Cancel,
    },
}

// cancellation state of a cancelable node.
struct Cancel(Mutex<CancelState>);

struct CancelState {
    // set exactly once
    err: Option<ContextError>,
    // materialized lazily. closed iff err is set.
    done: Option<Channel<()>>,
    // descendants for which this is the nearest cancelable ancestor. emptied on cancel.
    //
    // strong, so a descendant only observed through its done channel is still cancelled. each
    // descendant removes itself when cancelled on its own.
    children: HashMap<u64, Context>,
    // pending deadline task
    timer: Option<AbortOnDrop>,
}

/// The root context, which is never cancelled, has no deadline and carries no values
pub fn background() -> Context {
    static BACKGROUND: OnceLock<Context> = OnceLock::new();
    BACKGROUND.get_or_init(|| Context::empty("background", Channel::never())).clone()
}

/// Placeholder root context, for code that has not yet been given a real one
///
/// Behaves exactly like [`background`].
pub fn todo() -> Context {
    static TODO: OnceLock<Context> = OnceLock::new();
    TODO.get_or_init(|| Context::empty("todo", Channel::never())).clone()
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Relaxed)
}

impl Context {
    fn new(kind: Kind) -> Self {
        Context(Arc::new(Node { id: next_id(), kind }))
    }

    fn empty(name: &'static str, done: Channel<()>) -> Self {
        Self::new(Kind::Empty { name, done })
    }

    /// Create a root context which counts as done once the given channel is closed
    ///
    /// The root itself never reports an [`err`](Self::err), but cancelable descendants are
    /// cancelled with [`ContextError::Canceled`] when the channel closes. Deriving cancelable
    /// contexts from such a root spawns a task, so must happen within a tokio runtime.
    pub fn from_done(done: Channel<()>) -> Self {
        Self::empty("from_done", done)
    }

    /// Derive a context binding the key `K` to `value`
    pub fn with_value<K: ContextKey>(&self, value: K::Value) -> Context {
        Self::new(Kind::Value {
            parent: self.clone(),
            key: TypeId::of::<K>(),
            key_name: type_name::<K>(),
            value: Box::new(value),
        })
    }

    /// Derive a context which can be cancelled explicitly
    ///
    /// It is also cancelled, with the same reason, when this context is cancelled.
    pub fn with_cancel(&self) -> CancelContext {
        let child = Self::new(Kind::Cancel { parent: self.clone(), cancel: Cancel::new() });
        propagate_cancel(self, &child);
        CancelContext(child)
    }

    /// Derive a context which is cancelled once `timeout` elapses
    ///
    /// Must be called within a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> CancelContext {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context which is cancelled once `deadline` passes
    ///
    /// If this context's own deadline is earlier, the derived context keeps that one instead.
    /// Must be called within a tokio runtime.
    pub fn with_deadline(&self, deadline: Instant) -> CancelContext {
        if self.deadline().is_some_and(|current| current < deadline) {
            // the current deadline fires first anyways
            return self.with_cancel();
        }
        let child = Self::new(Kind::Timer {
            parent: self.clone(),
            deadline,
            cancel: Cancel::new(),
        });
        propagate_cancel(self, &child);

        if deadline <= Instant::now() {
            trace!("deadline already passed");
            child.cancel(true, ContextError::DeadlineExceeded);
            return CancelContext(child);
        }
        if let Some(cancel) = child.cancel_state() {
            let mut lock = cancel.0.lock().unwrap();
            if lock.err.is_none() {
                // keeps the node alive until the deadline or until cancellation clears it
                let child = child.clone();
                lock.timer = Some(AbortOnDrop::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    trace!("context deadline exceeded");
                    child.cancel(true, ContextError::DeadlineExceeded);
                }));
            }
        }
        CancelContext(child)
    }

    /// The deadline of the nearest ancestor with one, if any
    pub fn deadline(&self) -> Option<Instant> {
        match &self.0.kind {
            Kind::Empty { .. } => None,
            Kind::Value { parent, .. } | Kind::Cancel { parent, .. } => parent.deadline(),
            Kind::Timer { deadline, .. } => Some(*deadline),
        }
    }

    /// Channel which is closed once this context is cancelled
    ///
    /// Nothing is ever written into it, so reads resolve to `None` once done. Contexts which can
    /// never be cancelled return [`Channel::never`].
    pub fn done(&self) -> Channel<()> {
        match &self.0.kind {
            Kind::Empty { done, .. } => done.clone(),
            Kind::Value { parent, .. } => parent.done(),
            Kind::Cancel { cancel, .. } | Kind::Timer { cancel, .. } => cancel.done(),
        }
    }

    /// Why this context was cancelled, or `None` if it has not been
    pub fn err(&self) -> Option<ContextError> {
        match &self.0.kind {
            Kind::Empty { .. } => None,
            Kind::Value { parent, .. } => parent.err(),
            Kind::Cancel { cancel, .. } | Kind::Timer { cancel, .. } => {
                cancel.0.lock().unwrap().err.clone()
            }
        }
    }

    /// The value bound to `K` by the nearest ancestor binding it, if any
    pub fn value<K: ContextKey>(&self) -> Option<&K::Value> {
        match &self.0.kind {
            Kind::Empty { .. } => None,
            Kind::Value { parent, key, value, .. } => {
                if *key == TypeId::of::<K>() {
                    value.downcast_ref()
                } else {
                    parent.value::<K>()
                }
            }
            Kind::Cancel { parent, .. } | Kind::Timer { parent, .. } => parent.value::<K>(),
        }
    }

    /// Wait until this context is done
    pub fn wait(&self) -> ReadFut<()> {
        self.done().read()
    }

    /// Sleep for `duration`, unless this context is done first
    ///
    /// Returns true if the full duration elapsed, or false if cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }

    fn parent(&self) -> Option<&Context> {
        match &self.0.kind {
            Kind::Empty { .. } => None,
            Kind::Value { parent, .. }
            | Kind::Cancel { parent, .. }
            | Kind::Timer { parent, .. } => Some(parent),
        }
    }

    fn cancel_state(&self) -> Option<&Cancel> {
        match &self.0.kind {
            Kind::Cancel { cancel, .. } | Kind::Timer { cancel, .. } => Some(cancel),
            Kind::Empty { .. } | Kind::Value { .. } => None,
        }
    }

    // this context if it is cancelable, else the nearest cancelable ancestor.
    fn cancel_ancestor(&self) -> Option<&Context> {
        match &self.0.kind {
            Kind::Empty { .. } => None,
            Kind::Value { parent, .. } => parent.cancel_ancestor(),
            Kind::Cancel { .. } | Kind::Timer { .. } => Some(self),
        }
    }

    // cancel this node and its descendants with `err`, unless already cancelled.
    //
    // `remove_from_parent` is false when cascading, as the parent clears its whole child set.
    fn cancel(&self, remove_from_parent: bool, err: ContextError) {
        let Some(cancel) = self.cancel_state() else { return };
        let (done, children) = {
            let mut lock = cancel.0.lock().unwrap();
            if lock.err.is_some() {
                return;
            }
            lock.err = Some(err.clone());
            lock.timer = None;
            let done = lock.done.get_or_insert_with(Channel::closed).clone();
            (done, std::mem::take(&mut lock.children))
        };
        debug!(context = ?self, reason = %err, children = children.len(), "context cancelled");
        done.close();
        for child in children.into_values() {
            child.cancel(false, err.clone());
        }
        if remove_from_parent {
            let ancestor = self.parent().and_then(Context::cancel_ancestor);
            if let Some(cancel) = ancestor.and_then(Context::cancel_state) {
                // dropped outside the lock
                let removed = cancel.0.lock().unwrap().children.remove(&self.0.id);
                drop(removed);
            }
        }
    }
}

impl Cancel {
    fn new() -> Self {
        Cancel(Mutex::new(CancelState {
            err: None,
            done: None,
            children: HashMap::new(),
            timer: None,
        }))
    }

    fn done(&self) -> Channel<()> {
        self.0.lock().unwrap().done.get_or_insert_with(|| Channel::new(0)).clone()
    }
}

// arrange for `child` to be cancelled when `parent` is.
fn propagate_cancel(parent: &Context, child: &Context) {
    let parent_done = parent.done();
    if parent_done.is_never() {
        return;
    }
    if let Some(err) = parent.err() {
        child.cancel(false, err);
        return;
    }
    match parent.cancel_ancestor().and_then(Context::cancel_state) {
        Some(cancel) => {
            let mut lock = cancel.0.lock().unwrap();
            match lock.err.clone() {
                Some(err) => {
                    // cancelled since checked above
                    drop(lock);
                    child.cancel(false, err);
                }
                None => {
                    lock.children.insert(child.0.id, child.clone());
                }
            }
        }
        None => {
            // root over an external done channel, so watch it
            trace!("spawning watcher for external done channel");
            let child = child.clone();
            tokio::spawn(async move {
                let mut parent_done = parent_done.read_case();
                let mut child_done = child.done().read_case();
                let selected = select(&mut [&mut parent_done, &mut child_done], false).await;
                if let Ok(Selected::Case(0)) = selected {
                    child.cancel(false, ContextError::Canceled);
                }
            });
        }
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.0.kind {
            Kind::Empty { name, .. } => f.write_str(name),
            Kind::Value { parent, key_name, .. } => write!(f, "{:?}.with_value({})", parent, key_name),
            Kind::Cancel { parent, .. } => write!(f, "{:?}.with_cancel", parent),
            Kind::Timer { parent, deadline, .. } => {
                write!(f, "{:?}.with_deadline({:?})", parent, deadline)
            }
        }
    }
}


/// Context which can be cancelled by its owner
///
/// Derefs to the [`Context`] it controls. Dropping it does not cancel the context.
#[derive(Clone)]
pub struct CancelContext(Context);

impl CancelContext {
    /// Cancel the context and its descendants with [`ContextError::Canceled`]
    ///
    /// Does nothing if already cancelled.
    pub fn cancel(&self) {
        self.cancel_with(ContextError::Canceled);
    }

    /// Cancel the context and its descendants with the given reason
    ///
    /// Does nothing if already cancelled, keeping the first reason.
    pub fn cancel_with(&self, err: ContextError) {
        self.0.cancel(true, err);
    }

    /// Get a handle to the controlled context, without the ability to cancel it
    pub fn context(&self) -> Context {
        self.0.clone()
    }
}

impl Deref for CancelContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.0
    }
}

impl Debug for CancelContext {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct K1;

    impl ContextKey for K1 {
        type Value = u32;
    }

    struct K2;

    impl ContextKey for K2 {
        type Value = &'static str;
    }

    fn children(ctx: &Context) -> usize {
        ctx.cancel_state().unwrap().0.lock().unwrap().children.len()
    }

    fn timer_armed(ctx: &Context) -> bool {
        ctx.cancel_state().unwrap().0.lock().unwrap().timer.is_some()
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_cascades_with_reason() {
        let a = background().with_cancel();
        let b = a.with_timeout(Duration::from_secs(3600));
        let c = b.with_value::<K1>(1);
        let d = c.with_cancel();
        assert!(timer_armed(&b));
        assert_eq!(children(&a), 1);
        assert_eq!(children(&b), 1);
        let d_done = d.done();

        a.cancel_with(ContextError::reason("X"));

        for ctx in [&*a, &*b, &c, &*d] {
            assert_eq!(ctx.err(), Some(ContextError::reason("X")));
            assert_eq!(ctx.wait().await, None);
        }
        assert_eq!(d_done.read().await, None);
        assert!(!timer_armed(&b));
        assert_eq!(children(&a), 0);
        assert_eq!(children(&b), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_without_explicit_cancel() {
        let start = Instant::now();
        let ctx = background().with_timeout(Duration::from_millis(5));
        assert_eq!(ctx.deadline(), Some(start + Duration::from_millis(5)));
        assert_eq!(ctx.err(), None);
        ctx.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
        let err = ctx.err().unwrap();
        assert_eq!(err, ContextError::DeadlineExceeded);
        assert!(err.is_temporary());
        assert!(!timer_armed(&ctx));
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_cancels_immediately() {
        let ctx = background().with_timeout(Duration::ZERO);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert!(ctx.done().is_closed());
        assert!(!timer_armed(&ctx));
    }

    #[test]
    fn values_are_scoped() {
        let ctx1 = background().with_value::<K1>(1);
        let ctx2 = ctx1.with_value::<K2>("two");
        let ctx3 = ctx2.with_cancel();
        let ctx4 = ctx3.with_value::<K1>(3);
        assert_eq!(ctx4.value::<K1>(), Some(&3));
        assert_eq!(ctx4.value::<K2>(), Some(&"two"));
        assert_eq!(ctx3.value::<K1>(), Some(&1));
        assert_eq!(ctx1.value::<K2>(), None);
        assert_eq!(background().value::<K1>(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_reports_whether_it_was_cut_short() {
        let ctx = background().with_cancel();
        assert!(ctx.sleep(Duration::from_millis(10)).await);
        ctx.cancel();
        assert!(!ctx.sleep(Duration::from_secs(3600)).await);

        let timed = background().with_timeout(Duration::from_millis(5));
        let start = Instant::now();
        assert!(!timed.sleep(Duration::from_secs(3600)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_are_inherited() {
        let parent = background().with_timeout(Duration::from_secs(10));
        let deadline = parent.deadline().unwrap();

        let later = parent.with_deadline(deadline + Duration::from_secs(60));
        assert_eq!(later.deadline(), Some(deadline));
        assert!(matches!(later.0 .0.kind, Kind::Cancel { .. }));

        let sooner = parent.with_timeout(Duration::from_secs(1));
        assert!(sooner.deadline().unwrap() < deadline);

        let value = sooner.with_value::<K1>(0);
        assert_eq!(value.deadline(), sooner.deadline());
        assert_eq!(background().deadline(), None);
    }

    #[test]
    fn cancelled_child_leaves_parent() {
        let parent = background().with_cancel();
        let child = parent.with_value::<K2>("v").with_cancel();
        assert_eq!(children(&parent), 1);
        child.cancel();
        assert_eq!(children(&parent), 0);
        assert_eq!(parent.err(), None);
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_child_done_closes_with_parent() {
        let parent = background().with_cancel();
        let done = parent.with_cancel().done();
        let nested = parent.with_value::<K1>(7).with_cancel().with_value::<K2>("v").done();
        assert_eq!(children(&parent), 2);

        parent.cancel();
        let read = tokio::time::timeout(Duration::from_secs(1), done.read()).await;
        assert_eq!(read, Ok(None));
        let read = tokio::time::timeout(Duration::from_secs(1), nested.read()).await;
        assert_eq!(read, Ok(None));
        assert_eq!(children(&parent), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_after_handle_dropped() {
        let done = background().with_timeout(Duration::from_millis(5)).done();
        let read = tokio::time::timeout(Duration::from_secs(1), done.read()).await;
        assert_eq!(read, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timeout_children_detach_from_parent() {
        let parent = background().with_cancel();
        for _ in 0..1000 {
            drop(parent.with_timeout(Duration::from_millis(1)));
        }
        assert_eq!(children(&parent), 1000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(children(&parent), 0);
        assert_eq!(parent.err(), None);
    }

    #[test]
    fn cancel_is_idempotent() {
        let ctx = background().with_cancel();
        ctx.cancel_with(ContextError::reason("first"));
        ctx.cancel_with(ContextError::reason("second"));
        ctx.cancel();
        assert_eq!(ctx.err(), Some(ContextError::reason("first")));
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = background().with_cancel();
        parent.cancel();
        let child = parent.with_cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert!(child.done().is_closed());
        assert_eq!(children(&parent), 0);
    }

    #[test]
    fn done_closes_once_cancelled() {
        let ctx = background().with_cancel();
        let done = ctx.done();
        assert!(!done.is_closed());
        assert!(done.same_channel(&ctx.done()));
        ctx.cancel();
        assert!(done.is_closed());

        // never materialized before cancellation
        let other = background().with_cancel();
        other.cancel();
        assert!(other.done().is_closed());

        assert!(background().done().is_never());
        assert!(todo().done().is_never());
    }

    #[tokio::test]
    async fn external_root_cancels_descendants() {
        let external = Channel::new(0);
        let root = Context::from_done(external.clone());
        let child = root.with_cancel();
        let grandchild = child.with_cancel();
        assert_eq!(root.err(), None);
        assert_eq!(child.err(), None);

        external.close();
        grandchild.wait().await;
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
        assert_eq!(root.err(), None);
    }

    #[tokio::test]
    async fn external_root_watcher_ends_with_child() {
        let external = Channel::<()>::new(0);
        let root = Context::from_done(external.clone());
        let child = root.with_cancel();
        child.cancel_with(ContextError::reason("early"));
        tokio::task::yield_now().await;
        external.close();
        tokio::task::yield_now().await;
        assert_eq!(child.err(), Some(ContextError::reason("early")));
    }

    #[test]
    fn debug_shows_lineage() {
        let ctx = todo().with_value::<K1>(0).with_cancel();
        let shown = format!("{:?}", ctx);
        assert!(shown.starts_with("todo.with_value("), "{}", shown);
        assert!(shown.ends_with("K1).with_cancel"), "{}", shown);
    }
}
