//! Pluggable log decoding.

use crate::error::DecodeError;
use crate::types::{Log, Token, Transfer};

/// Turns a raw log into a typed transfer.
///
/// Implementations are stateless: the result depends only on the log and the
/// implementation's table of known event signatures.
/// - `Ok(None)`: unknown signature; the log is stored without a transfer.
/// - `Err(_)`: known signature, malformed payload; logged and skipped.
pub trait LogDecoder: Send + Sync {
    fn decode(&self, log: &Log) -> Result<Option<Transfer>, DecodeError>;

    /// Token metadata the log itself announces, e.g. a bridged token's
    /// initialisation event. Takes precedence over metadata read from the chain.
    fn announced_token(&self, _log: &Log) -> Result<Option<Token>, DecodeError> {
        Ok(None)
    }
}

/// Decoder that recognises nothing; every log is stored as a plain log.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDecoder;

impl LogDecoder for NoopDecoder {
    fn decode(&self, _log: &Log) -> Result<Option<Transfer>, DecodeError> {
        Ok(None)
    }
}
