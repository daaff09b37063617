//! transaction coordination and the status reported by the backend.

use super::{adapter::Adapter, error::Error};

/// backend transaction status, tracked from every ready-for-query marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// not inside a transaction block.
    Idle,
    /// inside a transaction block.
    Active,
    /// inside a failed transaction block. statements are rejected until
    /// ROLLBACK.
    InError,
}

impl TransactionStatus {
    pub(crate) fn from_status_byte(status: u8) -> Self {
        match status {
            b'T' => Self::Active,
            b'E' => Self::InError,
            _ => Self::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// transaction depth bookkeeping plus the rollback owed by a dropped guard.
/// lives outside the connection mutex so [Transaction]'s `Drop` can record
/// the debt without blocking; the next operation on the adapter settles it.
pub(crate) struct TxState {
    pub(crate) depth: u32,
    pub(crate) pending_rollback: Option<(u32, Box<str>)>,
}

impl TxState {
    pub(crate) fn new() -> Self {
        Self {
            depth: 0,
            pending_rollback: None,
        }
    }

    pub(crate) fn begin_sql(&self) -> (u32, String) {
        let depth = self.depth + 1;
        let sql = if depth == 1 {
            String::from("BEGIN")
        } else {
            format!("SAVEPOINT sp_{depth}")
        };
        (depth, sql)
    }

    pub(crate) fn commit_sql(depth: u32) -> String {
        if depth <= 1 {
            String::from("COMMIT")
        } else {
            format!("RELEASE SAVEPOINT sp_{depth}")
        }
    }

    pub(crate) fn rollback_sql(depth: u32) -> String {
        if depth <= 1 {
            String::from("ROLLBACK")
        } else {
            format!("ROLLBACK TO SAVEPOINT sp_{depth}")
        }
    }

    /// record the rollback owed by an unfinished guard. the outermost debt
    /// wins: rolling back depth 1 subsumes every savepoint above it.
    pub(crate) fn note_rollback(&mut self, depth: u32) {
        match &self.pending_rollback {
            Some((recorded, _)) if *recorded <= depth => {}
            _ => self.pending_rollback = Some((depth, Self::rollback_sql(depth).into())),
        }
        self.depth = self.depth.min(depth.saturating_sub(1));
    }
}

/// a transaction guard. commit or roll back explicitly; a guard dropped
/// without either owes a rollback that the next operation on the adapter
/// performs before anything else runs.
///
/// nested guards created with [Transaction::savepoint] map to savepoints,
/// with the same semantics as the non pipelined adapters.
#[must_use]
pub struct Transaction<'a> {
    adapter: &'a Adapter,
    depth: u32,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(adapter: &'a Adapter, depth: u32) -> Self {
        Self {
            adapter,
            depth,
            done: false,
        }
    }

    /// open a nested transaction via a savepoint. the outer guard is
    /// inaccessible until the returned guard is finished.
    pub async fn savepoint(&mut self) -> Result<Transaction<'_>, Error> {
        self.adapter.begin_nested().await
    }

    /// Consumes the transaction, committing all changes made within it.
    pub async fn commit(mut self) -> Result<(), Error> {
        self.done = true;
        self.adapter.finish_tx(self.depth, TxState::commit_sql(self.depth)).await
    }

    /// Rolls the transaction back, discarding all changes made within it.
    pub async fn rollback(mut self) -> Result<(), Error> {
        self.done = true;
        self.adapter
            .finish_tx(self.depth, TxState::rollback_sql(self.depth))
            .await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.adapter.note_rollback(self.depth);
        }
    }
}
