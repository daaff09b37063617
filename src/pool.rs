//! a small connection pool over [Adapter]s.
//!
//! the pool's contract with the pipeline is the check-in hook: before a
//! connection is reused its outstanding handles are drained and any open
//! transaction rolled back, so a checkout always starts from an empty queue.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use tokio::sync::{Semaphore, SemaphorePermit};

use super::{
    adapter::Adapter,
    config::Config,
    error::Error,
    transport::{Connect, Connector},
    types::TypeRegistry,
};

/// builder type for connection pool
pub struct PoolBuilder {
    config: Result<Config, Error>,
    capacity: usize,
    connector: Arc<dyn Connect>,
    registry: TypeRegistry,
}

impl PoolBuilder {
    /// set capacity. pool would spawn up to amount of capacity concurrent
    /// connections to database.
    ///
    /// # Default
    /// capacity default to 1
    pub fn capacity(mut self, cap: usize) -> Self {
        self.capacity = cap;
        self
    }

    /// set connector type for establishing connections. C must impl
    /// [`Connect`] trait
    pub fn connector<C>(mut self, connector: C) -> Self
    where
        C: Connect + 'static,
    {
        self.connector = Arc::new(connector);
        self
    }

    /// install the type registry every pooled connection resolves column
    /// types through.
    pub fn type_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// try convert builder to a connection pool instance.
    pub fn build(self) -> Result<Pool, Error> {
        let cfg = self.config?;

        Ok(Pool {
            conn: Mutex::new(VecDeque::with_capacity(self.capacity)),
            permits: Semaphore::new(self.capacity),
            config: Box::new(PoolConfig {
                cfg,
                connector: self.connector,
                registry: self.registry,
            }),
        })
    }
}

pub struct Pool {
    conn: Mutex<VecDeque<Adapter>>,
    permits: Semaphore,
    config: Box<PoolConfig>,
}

struct PoolConfig {
    cfg: Config,
    connector: Arc<dyn Connect>,
    registry: TypeRegistry,
}

impl Pool {
    /// start a builder of pool where it's behavior can be configured.
    pub fn builder<C>(cfg: C) -> PoolBuilder
    where
        Config: TryFrom<C>,
        Error: From<<Config as TryFrom<C>>::Error>,
    {
        PoolBuilder {
            config: cfg.try_into().map_err(Into::into),
            capacity: 1,
            connector: Arc::new(Connector),
            registry: TypeRegistry::new(),
        }
    }

    /// check out a connection, spawning a new one when the pool is empty.
    /// a connection returned without an explicit release runs the check-in
    /// hook here, so the checkout always sees an empty pipeline.
    pub async fn get(&self) -> Result<PoolConnection<'_>, Error> {
        let _permit = self.permits.acquire().await.expect("Semaphore must not be closed");

        let conn = loop {
            match self.try_get() {
                Some(conn) => {
                    conn.check_in().await;
                    if conn.closed().await {
                        continue;
                    }
                    break conn;
                }
                None => break self.connect().await?,
            }
        };

        Ok(PoolConnection {
            pool: self,
            conn: Some(conn),
            _permit,
        })
    }

    fn try_get(&self) -> Option<Adapter> {
        self.conn.lock().unwrap().pop_front()
    }

    #[cold]
    #[inline(never)]
    async fn connect(&self) -> Result<Adapter, Error> {
        Adapter::builder(self.config.cfg.clone())
            .connector_shared(self.config.connector.clone())
            .type_registry(self.config.registry.clone())
            .connect()
            .await
    }
}

/// a RAII type for a pooled connection.
pub struct PoolConnection<'a> {
    pool: &'a Pool,
    conn: Option<Adapter>,
    _permit: SemaphorePermit<'a>,
}

impl PoolConnection<'_> {
    /// run the check-in hook and hand the connection back. preferred over
    /// plain dropping: in-flight handles are drained here instead of at the
    /// next checkout.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            conn.check_in().await;
            self.pool.conn.lock().unwrap().push_back(conn);
        }
    }
}

impl Deref for PoolConnection<'_> {
    type Target = Adapter;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PoolConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PoolConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.conn.lock().unwrap().push_back(conn);
        }
    }
}
