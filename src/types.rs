//! type resolution for result columns.
//!
//! the registry is populated when the adapter is constructed and consulted
//! whenever a row description is materialized into [Column]s. unknown oids
//! resolve to an opaque type so rows stay accessible as raw bytes.
//!
//! [Column]: crate::column::Column

use std::collections::HashMap;

pub use postgres_types::{FromSql, FromSqlOwned, Kind, Oid, ToSql, Type};

#[derive(Clone)]
pub struct TypeRegistry {
    overrides: HashMap<Oid, Type>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    /// register a decoder type for an oid. takes precedence over the built in
    /// postgres catalog types.
    pub fn register(&mut self, oid: Oid, ty: Type) -> &mut Self {
        self.overrides.insert(oid, ty);
        self
    }

    /// resolve the type used to decode a column. `modifier` is the type
    /// modifier from the row description and is only carried for diagnostics.
    pub fn resolve(&self, oid: Oid, _modifier: i32, name: &str) -> Type {
        if let Some(ty) = self.overrides.get(&oid) {
            return ty.clone();
        }
        Type::from_oid(oid)
            .unwrap_or_else(|| Type::new(format!("unknown<{name}>"), oid, Kind::Simple, String::from("pg_catalog")))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_and_override() {
        let mut registry = TypeRegistry::new();
        assert_eq!(registry.resolve(23, -1, "id"), Type::INT4);

        registry.register(23, Type::TEXT);
        assert_eq!(registry.resolve(23, -1, "id"), Type::TEXT);
    }

    #[test]
    fn unknown_oid_is_opaque() {
        let registry = TypeRegistry::new();
        let ty = registry.resolve(999_999, -1, "custom");
        assert_eq!(ty.oid(), 999_999);
    }
}
