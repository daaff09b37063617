use core::fmt;

use super::types::Type;

/// Information about a column of a query.
#[derive(Clone)]
pub struct Column {
    name: Box<str>,
    r#type: Type,
    modifier: i32,
}

impl Column {
    pub(crate) fn new(name: &str, r#type: Type, modifier: i32) -> Column {
        Column {
            name: Box::from(name),
            r#type,
            modifier,
        }
    }

    /// Returns the name of the column.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the type of the column.
    pub fn r#type(&self) -> &Type {
        &self.r#type
    }

    /// Returns the type modifier reported by the backend, `-1` when absent.
    pub fn modifier(&self) -> i32 {
        self.modifier
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Column")
            .field("name", &self.name)
            .field("type", &self.r#type)
            .finish()
    }
}
