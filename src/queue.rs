use std::{collections::VecDeque, sync::Arc};

use super::deferred::DeferredCore;

/// FIFO of unresolved handles bound to one connection. the order equals the
/// order requests were transmitted, which equals the order of replies the
/// backend will produce. all mutation happens under the connection mutex and
/// the engine pops an entry before assigning to it, so a handle is dequeued
/// exactly once.
pub(crate) struct PendingQueue {
    inner: VecDeque<Arc<DeferredCore>>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, core: Arc<DeferredCore>) {
        self.inner.push_back(core);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Arc<DeferredCore>> {
        self.inner.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// fail every pending handle, front to back. used when the connection is
    /// reset or torn down while requests are still in flight.
    pub(crate) fn fail_all<F>(&mut self, mut err: F)
    where
        F: FnMut() -> crate::error::Error,
    {
        while let Some(core) = self.inner.pop_front() {
            core.assign_error(err());
        }
    }
}

#[cfg(test)]
mod test {
    use crate::error::ConnectionReset;

    use super::*;

    fn core(sql: &str) -> Arc<DeferredCore> {
        DeferredCore::new(sql.into(), "SQL".into(), Vec::new(), None, None)
    }

    #[test]
    fn fifo_order() {
        let mut queue = PendingQueue::new();

        let a = core("SELECT 1");
        let b = core("SELECT 2");
        let c = core("SELECT 3");

        queue.push(a.clone());
        queue.push(b.clone());
        queue.push(c.clone());

        assert_eq!(queue.len(), 3);

        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &a));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &b));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &c));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn fail_all_terminates_every_handle() {
        let mut queue = PendingQueue::new();
        let a = core("SELECT 1");
        let b = core("SELECT 2");
        queue.push(a.clone());
        queue.push(b.clone());

        queue.fail_all(|| ConnectionReset.into());

        assert!(queue.is_empty());
        assert!(a.terminal().unwrap().is_err());
        assert!(b.terminal().unwrap().is_err());
    }
}
