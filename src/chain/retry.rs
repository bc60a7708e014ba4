//! Retry policy for transaction submission
//!
//! Exponential backoff with a hard attempt bound, plus string-based
//! classification of provider errors into retryable and final.

use std::time::Duration;

use tracing::debug;

/// Transaction retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total submission attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// `attempts_made` failed attempts so far; may we make another?
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// What to do after the `attempts_made`-th failure of class `class`
    pub fn decide(&self, class: &ErrorClass, attempts_made: u32) -> RetryAction {
        match class {
            ErrorClass::Permanent => RetryAction::GiveUp,
            _ if !self.should_retry(attempts_made) => RetryAction::GiveUp,
            ErrorClass::NonceTooLow | ErrorClass::NonceTooHigh => {
                debug!(attempt = attempts_made, "Nonce out of sync - resyncing before retry");
                RetryAction::ResyncAndRetry(self.backoff_for_attempt(attempts_made.saturating_sub(1)))
            }
            ErrorClass::Transient | ErrorClass::Underpriced | ErrorClass::Unknown => {
                RetryAction::ResyncAndRetry(self.backoff_for_attempt(attempts_made.saturating_sub(1)))
            }
        }
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Transaction underpriced - the signer re-prices on the next attempt
    Underpriced,
    /// Nonce already used
    NonceTooLow,
    /// Nonce ahead of the chain
    NonceTooHigh,
    /// Permanent failure - do not retry (contract revert, bad signature)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    // Gas price errors
    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    // Nonce errors
    if error_lower.contains("nonce too low") || error_lower.contains("already known") {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    // Permanent errors
    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("not whitelisted")
        || error_lower.contains("unauthorized")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Drop the cached nonce, wait, then submit again
    ResyncAndRetry(Duration),
    /// Surface the error
    GiveUp,
}
