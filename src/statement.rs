//! server side prepared statements and their per connection cache.

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;

use super::{column::Column, types::Type};

/// a statement prepared on the backend. holds the server side name together
/// with the described parameter types and result columns.
#[derive(Clone)]
pub struct Statement {
    name: Box<str>,
    params: Box<[Type]>,
    columns: Arc<[Column]>,
}

impl Statement {
    pub(crate) fn new(name: Box<str>, params: Vec<Type>, columns: Arc<[Column]>) -> Self {
        Self {
            name,
            params: params.into_boxed_slice(),
            columns,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Returns the expected types of the statement's parameters.
    #[inline]
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    /// Returns information about the columns returned when the statement is queried.
    #[inline]
    pub fn columns(&self) -> &Arc<[Column]> {
        &self.columns
    }
}

/// sql text to prepared statement mapping with an LRU bound.
///
/// every live entry corresponds to a PREPARE that completed on the backend.
/// the caller deallocates whatever `insert` evicts; a bound of zero disables
/// caching and every prepared request runs through the unnamed statement.
pub(crate) struct StatementCache {
    cache: Option<LruCache<Box<str>, Statement>>,
    counter: u64,
}

impl StatementCache {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(limit).map(LruCache::new),
            counter: 0,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, LruCache::len)
    }

    /// look up and touch an entry.
    pub(crate) fn get(&mut self, sql: &str) -> Option<Statement> {
        self.cache.as_mut().and_then(|c| c.get(sql).cloned())
    }

    /// insert a freshly prepared statement. returns the entry pushed out by
    /// the LRU bound, which the caller must deallocate on the backend.
    pub(crate) fn insert(&mut self, sql: &str, stmt: Statement) -> Option<Statement> {
        self.cache
            .as_mut()
            .and_then(|c| c.push(Box::from(sql), stmt))
            .map(|(_, evicted)| evicted)
    }

    pub(crate) fn remove(&mut self, sql: &str) -> Option<Statement> {
        self.cache.as_mut().and_then(|c| c.pop(sql))
    }

    /// names are never reused within a connection, so a statement deallocated
    /// late cannot collide with a newer one.
    pub(crate) fn next_name(&mut self) -> Box<str> {
        self.counter += 1;
        format!("a{}", self.counter).into()
    }

    pub(crate) fn clear(&mut self) {
        if let Some(c) = self.cache.as_mut() {
            c.clear();
        }
    }
}

/// whether a statement writes. checked before transmission on read only
/// connections. leading whitespace, comments and parentheses are skipped.
pub(crate) fn is_write_statement(sql: &str) -> bool {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped.split_once('\n').map_or("", |(_, r)| r);
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = stripped.split_once("*/").map_or("", |(_, r)| r);
        } else if let Some(stripped) = rest.strip_prefix('(') {
            rest = stripped;
        } else {
            break;
        }
    }

    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    matches!(
        word.as_str(),
        "INSERT"
            | "UPDATE"
            | "DELETE"
            | "MERGE"
            | "TRUNCATE"
            | "CREATE"
            | "ALTER"
            | "DROP"
            | "GRANT"
            | "REVOKE"
            | "LOCK"
            | "COPY"
            | "REFRESH"
            | "REINDEX"
            | "CLUSTER"
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn stmt(cache: &mut StatementCache) -> Statement {
        let name = cache.next_name();
        Statement::new(name, Vec::new(), Arc::from(Vec::new()))
    }

    #[test]
    fn lru_bound_and_eviction_order() {
        let mut cache = StatementCache::new(2);
        assert!(cache.enabled());

        let s1 = stmt(&mut cache);
        let s2 = stmt(&mut cache);
        let s3 = stmt(&mut cache);

        assert!(cache.insert("SELECT 1", s1).is_none());
        assert!(cache.insert("SELECT 2", s2).is_none());
        assert_eq!(cache.len(), 2);

        // touch the older entry so the newer one becomes the eviction victim
        assert!(cache.get("SELECT 1").is_some());

        let evicted = cache.insert("SELECT 3", s3).unwrap();
        assert_eq!(evicted.name(), "a2");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("SELECT 2").is_none());
        assert!(cache.get("SELECT 1").is_some());
    }

    #[test]
    fn names_are_not_reused() {
        let mut cache = StatementCache::new(1);
        assert_eq!(&*cache.next_name(), "a1");
        assert_eq!(&*cache.next_name(), "a2");
        cache.clear();
        assert_eq!(&*cache.next_name(), "a3");
    }

    #[test]
    fn zero_limit_disables_cache() {
        let mut cache = StatementCache::new(0);
        assert!(!cache.enabled());
        let s = Statement::new("a1".into(), Vec::new(), Arc::from(Vec::new()));
        assert!(cache.insert("SELECT 1", s).is_none());
        assert!(cache.get("SELECT 1").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn write_statement_detection() {
        assert!(is_write_statement("INSERT INTO users VALUES (1)"));
        assert!(is_write_statement("  update users set x = 1"));
        assert!(is_write_statement("-- comment\nDELETE FROM users"));
        assert!(is_write_statement("/* hint */ TRUNCATE users"));
        assert!(is_write_statement("(INSERT INTO t VALUES (1))"));

        assert!(!is_write_statement("SELECT * FROM users"));
        assert!(!is_write_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!is_write_statement("SHOW server_version"));
    }
}
