//! Internal utilities.

pub(crate) mod abort_on_drop;
pub(crate) mod random;
