//! Pending-call table shared by callers and the response reader.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::{Header, INVALID_SEQ};

/// A response routed to its waiter, body still encoded.
#[derive(Debug)]
pub(crate) struct Reply {
    pub header: Header,
    pub body: Bytes,
}

pub(crate) type ReplyTx = oneshot::Sender<Result<Reply>>;
pub(crate) type ReplyRx = oneshot::Receiver<Result<Reply>>;

struct PendingCall {
    method: String,
    tx: ReplyTx,
}

#[derive(Default)]
struct Table {
    /// Last sequence handed out; the first call gets 1.
    seq: u64,
    calls: HashMap<u64, PendingCall>,
    shutdown: bool,
}

/// Sequence counter and waiters behind one lock, so allocation and insertion
/// are observed together by the reader.
#[derive(Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<Table>,
}

impl PendingCalls {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next sequence number and park a waiter under it.
    pub fn register(&self, method: &str) -> Result<(u64, ReplyRx)> {
        let mut t = self.table();
        if t.shutdown {
            return Err(RpcError::ConnectionClosed);
        }
        t.seq += 1;
        let seq = t.seq;
        let (tx, rx) = oneshot::channel();
        t.calls.insert(
            seq,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        Ok((seq, rx))
    }

    /// Take the waiter for `seq`, if any. `INVALID_SEQ` never matches.
    pub fn take(&self, seq: u64) -> Option<ReplyTx> {
        if seq == INVALID_SEQ {
            return None;
        }
        self.table().calls.remove(&seq).map(|c| c.tx)
    }

    /// Drop a waiter that gave up (timeout, cancelled caller, failed send).
    pub fn remove(&self, seq: u64) -> bool {
        self.table().calls.remove(&seq).is_some()
    }

    /// Refuse new calls and fail every waiter with `ConnectionClosed`.
    pub fn terminate(&self) -> usize {
        let drained: Vec<(u64, PendingCall)> = {
            let mut t = self.table();
            t.shutdown = true;
            t.calls.drain().collect()
        };
        let n = drained.len();
        for (seq, call) in drained {
            tracing::debug!(seq, method = %call.method, "failing pending call");
            let _ = call.tx.send(Err(RpcError::ConnectionClosed));
        }
        n
    }

    pub fn is_shutdown(&self) -> bool {
        self.table().shutdown
    }

    pub fn len(&self) -> usize {
        self.table().calls.len()
    }
}
