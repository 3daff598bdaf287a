//! Engine Error Taxonomy (§7)
//!
//! Recoverable broker-level failures (invalid SL, missing ticket, unknown
//! symbol) are returned as `Result` and logged at the call site; fatal
//! failures (file I/O, data corruption) bubble via `?`/`anyhow::Context`
//! to `main`, which maps them to a non-zero exit code. Data exhaustion is
//! not modeled as an error — per spec.md §7 it is a typed sentinel `false`
//! return from the advance methods.

use crate::engine::position::Ticket;
use crate::engine::tick::Side;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid order for {symbol}: {reason}")]
    InvalidOrder { symbol: String, reason: String },

    #[error("duplicate position for {symbol} {side:?}: an existing position already carries this strategy tag")]
    DuplicatePosition { symbol: String, side: Side },

    #[error("unknown ticket {0}")]
    UnknownTicket(Ticket),

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("malformed cache file {path} at row {row}: {reason}")]
    MalformedCacheFile {
        path: String,
        row: usize,
        reason: String,
    },

    #[error("position persistence I/O error")]
    PersistenceIo(#[from] std::io::Error),

    #[error("position persistence format error")]
    PersistenceFormat(#[from] serde_json::Error),

    #[error("missing cross-rate to convert profit for {quote_currency} into {account_currency}; reporting in quote currency")]
    MissingCrossRate {
        quote_currency: String,
        account_currency: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
