use core::fmt;

use super::row::{Row, RowSet};

/// the materialized reply of a single request.
///
/// pipelined requests resolve to `RowSet` or `Affected` depending on whether
/// the statement returns columns. administrative statements run through the
/// simple protocol and resolve to `Raw` text rows. `None` is what remains of a
/// failure consumed by an error hook: the request terminated without an
/// observable result.
pub enum QueryOutcome {
    RowSet(RowSet),
    Affected(u64),
    Raw(Vec<Vec<Option<String>>>),
    None,
}

impl QueryOutcome {
    /// rows of a row returning statement.
    pub fn row_set(&self) -> Option<&RowSet> {
        match self {
            Self::RowSet(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_row_set(self) -> Option<RowSet> {
        match self {
            Self::RowSet(rows) => Some(rows),
            _ => None,
        }
    }

    /// rows cloned out of the outcome. empty for non row returning statements.
    pub fn rows(&self) -> Vec<Row> {
        match self {
            Self::RowSet(set) => set.rows().to_vec(),
            _ => Vec::new(),
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.row_set().and_then(RowSet::first)
    }

    /// number of rows returned or affected.
    pub fn affected(&self) -> u64 {
        match self {
            Self::RowSet(set) => set.len() as u64,
            Self::Affected(n) => *n,
            Self::Raw(rows) => rows.len() as u64,
            Self::None => 0,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Debug for QueryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowSet(set) => f.debug_tuple("RowSet").field(set).finish(),
            Self::Affected(n) => f.debug_tuple("Affected").field(n).finish(),
            Self::Raw(rows) => f.debug_tuple("Raw").field(&rows.len()).finish(),
            Self::None => f.write_str("None"),
        }
    }
}
