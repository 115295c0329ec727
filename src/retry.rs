//! Bounded retry shared by the command engine and the block transfers.

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt<T, E> {
    /// Finished, stop with this value.
    Done(T),
    /// Transient failure, try again while attempts remain.
    Retry(E),
    /// Definite failure, stop now.
    Fatal(E),
}

/// Run `attempt` until it is done, fails fatally, or `max_attempts` transient
/// failures were seen. The closure gets the 1-based attempt number; anything
/// below 1 for `max_attempts` still runs one attempt.
pub(crate) fn retry<T, E, F>(max_attempts: usize, mut attempt: F) -> Result<T, E>
where
    F: FnMut(usize) -> Attempt<T, E>,
{
    let mut number = 1;
    loop {
        match attempt(number) {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retry(err) if number >= max_attempts => return Err(err),
            Attempt::Retry(_) => number += 1,
        }
    }
}
