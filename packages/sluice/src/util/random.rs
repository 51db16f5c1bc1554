// randomized selection helpers.
//
// waiter selection and the select shuffle both reduce to one primitive: pick a uniformly random
// element of a slice and swap it into the last position. callers then pop it (waiter lists), or
// shrink the slice and repeat (fisher-yates).

use rand::{thread_rng, Rng};


// swap a uniformly random element of the slice into its last position.
//
// panics if the slice is empty.
pub(crate) fn random_to_back<E>(slice: &mut [E]) {
    assert!(!slice.is_empty(), "random_to_back on empty slice");
    let last = slice.len() - 1;
    let idx = thread_rng().gen_range(0..slice.len());
    slice.swap(idx, last);
}

// uniformly permute the slice in place (fisher-yates, back to front).
pub(crate) fn shuffle<E>(slice: &mut [E]) {
    for n in (2..=slice.len()).rev() {
        random_to_back(&mut slice[..n]);
    }
}
