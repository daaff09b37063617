//! deferred result handles.
//!
//! issuing a request in pipeline mode returns a [Deferred] immediately. the
//! reply is read from the socket when the handle is forced, or as a side
//! effect of forcing a handle issued after it on the same connection.

use core::panic::Location;

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use super::{
    column::Column,
    dispatch::Shared,
    error::Error,
    outcome::QueryOutcome,
    row::Row,
};

/// applied to a successful outcome exactly once, at resolution time.
pub(crate) type Callback = Box<dyn FnOnce(QueryOutcome) -> QueryOutcome + Send>;

/// invoked in registration order when the request fails. returning `Ok(())`
/// consumes the failure; returning an error replaces it for later hooks.
pub type ErrorHook = Box<dyn FnOnce(Error) -> Result<(), Error> + Send>;

/// one encoded bind parameter, exactly as transmitted. kept so a request can
/// be re-issued after a cached plan invalidation and shown in diagnostics.
#[derive(Clone)]
pub(crate) struct BindValue {
    pub(crate) format: i16,
    pub(crate) value: Option<Vec<u8>>,
}

/// marks a handle whose statement came from the prepared statement cache.
/// consumed on the first cached-plan failure so the request retries at most once.
pub(crate) struct RetryTicket;

enum State {
    Pending {
        callback: Option<Callback>,
        hooks: Vec<ErrorHook>,
        retry: Option<RetryTicket>,
    },
    Resolved {
        outcome: Arc<QueryOutcome>,
        at: Instant,
    },
    Failed {
        error: Arc<Error>,
    },
}

pub(crate) struct DeferredCore {
    pub(crate) sql: Box<str>,
    pub(crate) name: Box<str>,
    pub(crate) binds: Vec<BindValue>,
    pub(crate) expected_columns: Option<Arc<[Column]>>,
    pub(crate) created_at: Instant,
    pub(crate) origin: Option<&'static Location<'static>>,
    state: Mutex<State>,
}

impl DeferredCore {
    pub(crate) fn new(
        sql: Box<str>,
        name: Box<str>,
        binds: Vec<BindValue>,
        expected_columns: Option<Arc<[Column]>>,
        origin: Option<&'static Location<'static>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sql,
            name,
            binds,
            expected_columns,
            created_at: Instant::now(),
            origin,
            state: Mutex::new(State::Pending {
                callback: None,
                hooks: Vec::new(),
                retry: None,
            }),
        })
    }

    pub(crate) fn set_callback(&self, callback: Callback) {
        if let State::Pending { callback: slot, .. } = &mut *self.state.lock().unwrap() {
            *slot = Some(callback);
        }
    }

    pub(crate) fn push_hook(&self, hook: ErrorHook) {
        if let State::Pending { hooks, .. } = &mut *self.state.lock().unwrap() {
            hooks.push(hook);
        }
    }

    pub(crate) fn set_retry(&self, ticket: RetryTicket) {
        if let State::Pending { retry, .. } = &mut *self.state.lock().unwrap() {
            *retry = Some(ticket);
        }
    }

    pub(crate) fn take_retry(&self) -> Option<RetryTicket> {
        match &mut *self.state.lock().unwrap() {
            State::Pending { retry, .. } => retry.take(),
            _ => None,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Pending { .. })
    }

    /// first terminal transition with success. the registered callback is
    /// applied here and never again.
    pub(crate) fn assign(&self, raw: QueryOutcome) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Pending { callback, .. } => callback.take(),
                _ => {
                    debug_assert!(false, "deferred handle resolved twice");
                    return;
                }
            }
        };
        let outcome = match callback {
            Some(callback) => callback(raw),
            None => raw,
        };
        *self.state.lock().unwrap() = State::Resolved {
            outcome: Arc::new(outcome),
            at: Instant::now(),
        };
    }

    /// first terminal transition with failure. hooks run in registration order
    /// outside the state lock; whatever error survives them is stored and
    /// raised on every force.
    pub(crate) fn assign_error(&self, err: Error) {
        let hooks = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Pending { hooks, .. } => std::mem::take(hooks),
                _ => {
                    debug_assert!(false, "deferred handle resolved twice");
                    return;
                }
            }
        };

        let mut current = Some(err);
        for hook in hooks {
            let Some(err) = current.take() else { break };
            if let Err(e) = hook(err) {
                current = Some(e);
            }
        }

        *self.state.lock().unwrap() = match current {
            Some(error) => State::Failed {
                error: Arc::new(error),
            },
            None => State::Resolved {
                outcome: Arc::new(QueryOutcome::None),
                at: Instant::now(),
            },
        };
    }

    /// terminal snapshot, if any. failures replay as shared errors so every
    /// force observes the original failure.
    pub(crate) fn terminal(&self) -> Option<Result<Arc<QueryOutcome>, Error>> {
        match &*self.state.lock().unwrap() {
            State::Pending { .. } => None,
            State::Resolved { outcome, .. } => Some(Ok(outcome.clone())),
            State::Failed { error } => Some(Err(Error::shared(error.clone()))),
        }
    }

    pub(crate) fn resolved_at(&self) -> Option<Instant> {
        match &*self.state.lock().unwrap() {
            State::Resolved { at, .. } => Some(*at),
            _ => None,
        }
    }
}

/// a placeholder for a reply not yet read from the socket.
///
/// all result accessors force materialization first: they block until the
/// dispatch engine has drained the reply stream up to this handle. identity,
/// scheduling state and hook registration do not force.
///
/// forcing a handle resolves every handle issued before it on the same
/// connection as a side effect.
pub struct Deferred {
    core: Arc<DeferredCore>,
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Deferred")
            .field("sql", &self.core.sql)
            .field("name", &self.core.name)
            .finish()
    }
}

impl Deferred {
    pub(crate) fn new(core: Arc<DeferredCore>, shared: Arc<Shared>) -> Self {
        Self { core, shared }
    }

    /// drain until this handle is terminal, then return the outcome or raise
    /// the stored failure. repeated forcing re-uses the materialized outcome
    /// without touching the connection.
    pub async fn force(&self) -> Result<Arc<QueryOutcome>, Error> {
        if let Some(terminal) = self.core.terminal() {
            return terminal;
        }
        self.shared.drain_for(&self.core).await?;
        match self.core.terminal() {
            Some(terminal) => terminal,
            None => Err(Error::unexpected()),
        }
    }

    /// forced accessor over the rows of the outcome. non row returning
    /// statements yield an empty vec.
    pub async fn rows(&self) -> Result<Vec<Row>, Error> {
        self.force().await.map(|outcome| outcome.rows())
    }

    /// forced accessor over the first row.
    pub async fn first(&self) -> Result<Option<Row>, Error> {
        self.force().await.map(|outcome| outcome.first().cloned())
    }

    /// forced accessor over the affected/returned row count.
    pub async fn affected(&self) -> Result<u64, Error> {
        self.force().await.map(|outcome| outcome.affected())
    }

    /// forced accessor over the column description.
    pub async fn columns(&self) -> Result<Vec<Column>, Error> {
        self.force().await.map(|outcome| {
            outcome
                .row_set()
                .map(|set| set.columns().to_vec())
                .unwrap_or_default()
        })
    }

    /// true while the reply has not been read yet. does not force.
    pub fn is_scheduled(&self) -> bool {
        self.core.is_pending()
    }

    /// true once resolved with a value. does not force.
    pub fn is_resolved(&self) -> bool {
        matches!(self.core.terminal(), Some(Ok(_)))
    }

    /// true once failed. does not force.
    pub fn is_failed(&self) -> bool {
        matches!(self.core.terminal(), Some(Err(_)))
    }

    /// install a post-processor applied to the outcome exactly once, at
    /// resolution time. has no effect once the handle is terminal. does not
    /// force.
    pub fn map_outcome<F>(&self, f: F) -> &Self
    where
        F: FnOnce(QueryOutcome) -> QueryOutcome + Send + 'static,
    {
        self.core.set_callback(Box::new(f));
        self
    }

    /// register an error hook. hooks run in registration order when the
    /// request fails; a hook returning `Ok(())` consumes the failure and the
    /// handle resolves to [QueryOutcome::None]. does not force.
    pub fn on_error<F>(&self, hook: F) -> &Self
    where
        F: FnOnce(Error) -> Result<(), Error> + Send + 'static,
    {
        self.core.push_hook(Box::new(hook));
        self
    }

    /// text of the issued statement.
    pub fn sql(&self) -> &str {
        &self.core.sql
    }

    /// call site that issued this request, when origin capture is enabled.
    pub fn origin(&self) -> Option<&'static Location<'static>> {
        self.core.origin
    }

    pub fn created_at(&self) -> Instant {
        self.core.created_at
    }

    pub fn resolved_at(&self) -> Option<Instant> {
        self.core.resolved_at()
    }
}

/// identity comparison. two handles are equal when they wrap the same request.
impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Deferred {}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::{ConnectionReset, StatementInvalid};

    use super::*;

    fn core() -> Arc<DeferredCore> {
        DeferredCore::new("SELECT 1".into(), "SQL".into(), Vec::new(), None, None)
    }

    #[test]
    fn terminal_exactly_once() {
        let core = core();
        assert!(core.is_pending());

        core.assign(QueryOutcome::Affected(3));
        let outcome = core.terminal().unwrap().unwrap();
        assert_eq!(outcome.affected(), 3);

        // a second transition is ignored in release builds
        assert!(core.resolved_at().is_some());
    }

    #[test]
    fn callback_applied_once_on_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let core = core();
        core.set_callback(Box::new(move |outcome| {
            seen.fetch_add(1, Ordering::SeqCst);
            QueryOutcome::Affected(outcome.affected() + 1)
        }));

        core.assign(QueryOutcome::Affected(1));
        assert_eq!(core.terminal().unwrap().unwrap().affected(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_not_applied_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let core = core();
        core.set_callback(Box::new(move |outcome| {
            seen.fetch_add(1, Ordering::SeqCst);
            outcome
        }));

        core.assign_error(ConnectionReset.into());
        assert!(core.terminal().unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hook_consumes_error() {
        let core = core();
        let flag = Arc::new(AtomicUsize::new(0));
        let seen = flag.clone();
        core.push_hook(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        core.assign_error(ConnectionReset.into());

        let outcome = core.terminal().unwrap().unwrap();
        assert!(outcome.is_none());
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_transforms_error_for_later_hooks() {
        let core = core();
        core.push_hook(Box::new(|_| Err(ConnectionReset.into())));

        let observed = Arc::new(AtomicUsize::new(0));
        let seen = observed.clone();
        core.push_hook(Box::new(move |e| {
            if e.downcast_ref::<ConnectionReset>().is_some() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Err(e)
        }));

        core.assign_error(Error::unexpected());

        let err = core.terminal().unwrap().unwrap_err();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(err.downcast_ref::<ConnectionReset>().is_some());
        assert!(err.downcast_ref::<StatementInvalid>().is_none());
    }

    #[test]
    fn retry_ticket_taken_once() {
        let core = core();
        core.set_retry(RetryTicket);
        assert!(core.take_retry().is_some());
        assert!(core.take_retry().is_none());
    }
}
