//! Classification of a single HTTP delivery attempt.

/// What the execution worker should do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx response.
    Delivered,
    /// Network error, timeout, missing status, 429 or 5xx.
    Retry,
    /// Any other status. Retrying will not help.
    Terminal,
}

/// Whether an attempt that ended with `status` (or the transport `error`)
/// should be retried.
///
/// A transport error always wins over a status.
pub fn should_retry(status: Option<u16>, error: Option<&str>) -> bool {
    if error.is_some() {
        return true;
    }
    match status {
        None => true,
        Some(200..=299) => false,
        Some(429) => true,
        Some(s) if s >= 500 => true,
        Some(_) => false,
    }
}

/// Maps an attempt result onto the delivery state machine.
pub fn classify(status: Option<u16>, error: Option<&str>) -> AttemptOutcome {
    if should_retry(status, error) {
        return AttemptOutcome::Retry;
    }
    match status {
        Some(200..=299) => AttemptOutcome::Delivered,
        _ => AttemptOutcome::Terminal,
    }
}
