//! Test-lifetime scope: failure reporting plus ordered cleanup
//!
//! A [`TestScope`] plays the role of the test reporter for everything the
//! harness does in the background. Supervisors report failures into it
//! instead of panicking on foreign tasks, and teardown hooks registered with
//! [`TestScope::on_cleanup`] run in reverse registration order when the test
//! calls [`TestScope::finish`].

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{FixtureError, FixtureResult};

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Clone)]
pub struct TestScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    name: String,
    failures: Mutex<Vec<String>>,
    cleanups: Mutex<Vec<Cleanup>>,
    finished: Mutex<bool>,
}

impl std::fmt::Debug for TestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestScope")
            .field("name", &self.inner.name)
            .field("failures", &self.inner.failures.lock().len())
            .finish()
    }
}

impl TestScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                failures: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                finished: Mutex::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Record a failure; the test fails when the scope finishes
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(scope = %self.inner.name, "❌ {}", message);
        self.inner.failures.lock().push(message);
    }

    pub fn failed(&self) -> bool {
        !self.inner.failures.lock().is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.inner.failures.lock().len()
    }

    pub fn failures(&self) -> Vec<String> {
        self.inner.failures.lock().clone()
    }

    /// Register an async cleanup to run when the scope finishes
    pub fn on_cleanup<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Cleanup = Box::new(move || Box::pin(cleanup()));
        self.inner.cleanups.lock().push(boxed);
    }

    /// Run cleanups newest-first, then fail if anything was reported
    ///
    /// A panicking cleanup is reported and the remaining ones still run.
    /// Cleanups registered while finishing run too.
    pub async fn finish(&self) -> FixtureResult<()> {
        loop {
            let next = self.inner.cleanups.lock().pop();
            let Some(cleanup) = next else { break };

            if let Err(e) = tokio::spawn(cleanup()).await {
                if e.is_panic() {
                    self.report_error(format!("cleanup panicked: {}", panic_message(e.into_panic())));
                } else {
                    self.report_error(format!("cleanup did not complete: {e}"));
                }
            }
        }
        *self.inner.finished.lock() = true;
        debug!(scope = %self.inner.name, "🧹 Scope finished");

        let failures = self.failures();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FixtureError::TestFailed {
                scope: self.inner.name.clone(),
                failures,
            })
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let pending = self.cleanups.get_mut().len();
        if pending > 0 && !*self.finished.get_mut() {
            warn!(
                scope = %self.name,
                "⚠️ Test scope dropped with {} cleanup(s) never run; call finish()",
                pending
            );
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_cleanups_run_in_reverse_order() {
        let scope = TestScope::new("lifo");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scope.on_cleanup(move || async move { order.lock().push(i) });
        }

        scope.finish().await.unwrap();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_panicking_cleanup_is_reported_and_others_still_run() {
        // Arrange
        let scope = TestScope::new("panics");
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        scope.on_cleanup(move || async move { *flag.lock() = true });
        scope.on_cleanup(|| async { panic!("boom") });

        // Act
        let result = scope.finish().await;

        // Assert
        assert!(*ran.lock());
        assert_matches!(result, Err(FixtureError::TestFailed { failures, .. }) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].contains("boom"));
        });
    }

    #[tokio::test]
    async fn test_reported_errors_fail_the_scope() {
        let scope = TestScope::new("reported");
        assert!(!scope.failed());

        scope.clone().report_error("server exited");

        assert!(scope.failed());
        assert_eq!(scope.failure_count(), 1);
        assert_matches!(scope.finish().await, Err(FixtureError::TestFailed { scope, .. }) if scope == "reported");
    }

    #[tokio::test]
    async fn test_cleanup_registered_during_finish_runs() {
        let scope = TestScope::new("nested");
        let ran = Arc::new(Mutex::new(false));
        let inner_scope = scope.clone();
        let flag = ran.clone();
        scope.on_cleanup(move || async move {
            inner_scope.on_cleanup(move || async move { *flag.lock() = true });
        });

        scope.finish().await.unwrap();
        assert!(*ran.lock());
    }
}
