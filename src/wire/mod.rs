//! Streaming wire I/O: serialization, parsing, the exchange state
//! machine, and the transport wrappers applied between the pool and the
//! state machine (idle read timeout, wire byte tee).

pub(crate) mod debug;
pub(crate) mod parse;
pub mod raw;
pub(crate) mod stream;
pub(crate) mod timeout;

pub use raw::RawStream;

use crate::pool::Transaction;

use debug::WireLog;
use timeout::IdleTimeout;

/// The transport stack handed to the state machine: the pooled
/// transaction wrapped with the idle-read deadline and the byte tee.
pub(crate) type WrappedIo = WireLog<IdleTimeout<Transaction>>;

/// Wrap a freshly acquired transaction according to the per-call options.
pub(crate) fn wrap_transaction(
    tx: Transaction,
    read_timeout: std::time::Duration,
    verbose: u8,
) -> WrappedIo {
    let conn_id = tx.id();
    WireLog::new(IdleTimeout::new(tx, read_timeout), verbose >= 3, conn_id)
}

/// Recover the transaction from the wrapper stack.
pub(crate) fn unwrap_transaction(io: WrappedIo) -> Transaction {
    io.into_inner().into_inner()
}
