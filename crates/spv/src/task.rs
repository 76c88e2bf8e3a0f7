//! Structured task groups with cancel-on-first-error semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use corvid_log::log_warn;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag shared by a group of tasks.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // register before checking so a concurrent cancel cannot
            // slip between the check and the wait
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of tasks sharing one cancel token. The first task to return
/// an error cancels every sibling; shutdown cancels and joins.
#[derive(Clone)]
pub struct TaskGroup {
    token: CancelToken,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            token: CancelToken::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task in the group. The future runs until it finishes,
    /// fails, or the group is cancelled.
    pub fn spawn<F, E>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = future => {
                    if let Err(err) = result {
                        log_warn!("task {name} failed: {err}");
                        token.cancel();
                    }
                }
            }
        });
        self.handles.lock().expect("task group lock").push(handle);
    }

    /// Cancel everything and wait for the tasks to wind down.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("task group lock"));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn error_cancels_siblings() {
        let group = TaskGroup::new();
        let token = group.token();
        group.spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), String>(())
        });
        group.spawn("failer", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), String>("boom".into())
        });
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("group should cancel itself");
        group.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_all_tasks() {
        let group = TaskGroup::new();
        for _ in 0..4 {
            group.spawn("sleeper", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), String>(())
            });
        }
        tokio::time::timeout(Duration::from_secs(5), group.shutdown())
            .await
            .expect("shutdown should not hang");
        assert!(group.is_cancelled());
    }
}
