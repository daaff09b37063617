use core::{fmt, ops::Range};

use std::sync::Arc;

use bytes::Bytes;
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::DataRowBody;
use postgres_types::WrongType;

use super::{
    column::Column,
    error::{Error, InvalidColumnIndex},
    types::FromSql,
};

/// A row of data returned from the database by a query.
///
/// Values are binary encoded and decoded on access through [FromSql].
#[derive(Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    data: Bytes,
    ranges: Box<[Option<Range<usize>>]>,
}

impl Row {
    pub(crate) fn try_new(columns: Arc<[Column]>, body: &DataRowBody) -> Result<Self, Error> {
        let mut iter = body.ranges();
        let mut ranges = Vec::with_capacity(iter.size_hint().0);
        while let Some(range) = iter.next()? {
            ranges.push(range);
        }
        Ok(Self {
            columns,
            data: Bytes::copy_from_slice(body.buffer()),
            ranges: ranges.into_boxed_slice(),
        })
    }

    /// Returns information about the columns of data in the row.
    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Determines if the row contains no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of values in the row.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Deserializes a value from the row.
    ///
    /// The value can be specified either by its numeric index in the row, or by
    /// its column name.
    ///
    /// # Panics
    /// Panics if the index is out of bounds or if the value cannot be converted
    /// to the specified type.
    #[inline]
    pub fn get<'r, T>(&'r self, idx: impl RowIndex + fmt::Display) -> T
    where
        T: FromSql<'r>,
    {
        self.try_get(&idx)
            .unwrap_or_else(|e| panic!("error retrieving column {idx}: {e}"))
    }

    /// Like [Row::get], but returns a `Result` rather than panicking.
    pub fn try_get<'r, T>(&'r self, idx: impl RowIndex + fmt::Display) -> Result<T, Error>
    where
        T: FromSql<'r>,
    {
        let idx = idx
            .position(&self.columns)
            .ok_or_else(|| InvalidColumnIndex(idx.to_string()))?;

        let ty = self.columns[idx].r#type();
        if !T::accepts(ty) {
            return Err(WrongType::new::<T>(ty.clone()).into());
        }

        let buf = self.ranges[idx].clone().map(|r| &self.data[r]);
        FromSql::from_sql_nullable(ty, buf).map_err(Error::from_boxed)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row").field("columns", &self.columns()).finish()
    }
}

/// types accepted as a column lookup key. either the zero based position or
/// the column name.
pub trait RowIndex {
    fn position(&self, columns: &[Column]) -> Option<usize>;
}

impl RowIndex for usize {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }
}

impl RowIndex for &str {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        columns.iter().position(|c| c.name() == *self)
    }
}

impl<T> RowIndex for &T
where
    T: RowIndex + ?Sized,
{
    fn position(&self, columns: &[Column]) -> Option<usize> {
        T::position(self, columns)
    }
}

/// A materialized set of rows sharing one column description.
#[derive(Clone)]
pub struct RowSet {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
}

impl RowSet {
    pub(crate) fn new(columns: Arc<[Column]>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = core::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl fmt::Debug for RowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSet")
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .finish()
    }
}
