//! Transaction and session id generation.

/// A pluggable id source. Ids only need to be unique among live
/// transactions/sessions of one manager; collisions are retried by the
/// caller.
pub type IdGenerator = Box<dyn FnMut() -> String + Send>;

const MAX_INT_ID: u64 = 1_000_000_000;

/// The default generator: a wrapping monotonic integer stringifier.
/// Starts at `"1"` and wraps back to `"1"` after 1e9.
pub fn int_generator() -> IdGenerator {
    int_generator_from(0)
}

fn int_generator_from(start: u64) -> IdGenerator {
    let mut idx = start;
    Box::new(move || {
        idx += 1;
        if idx > MAX_INT_ID {
            idx = 1;
        }
        idx.to_string()
    })
}
