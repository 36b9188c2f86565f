/// Classification for retry policy.
///
/// Used by the backoff policy and the price resolver to decide how to react
/// to an [`ExchangeError`](super::ExchangeError).
///
/// | Class | Backoff policy | Price resolver |
/// |-------|----------------|----------------|
/// | `Never` | Fail the call | Fail the tier |
/// | `WithBackoff` | Sleep and retry, bounded | Fall through to next tier |
/// | `ResyncClock` | Resync once, retry immediately | Fall through to next tier |
/// | `NextTier` | Fail the call | Fall through to next tier |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Terminal for this call: auth rejection, bad request, credential failure.
    Never,

    /// Transient: network failure or rate limiting. Retry after an
    /// exponentially growing, jittered delay.
    WithBackoff,

    /// The source rejected our timestamp. Resync the clock and retry once
    /// before falling back to normal backoff.
    ResyncClock,

    /// This source cannot answer (unsupported, unparsable); another source
    /// might.
    NextTier,
}
