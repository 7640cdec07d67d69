//! Operation Registry
//! Mission: Track in-flight facade operations for timeout reporting and cooperative cancellation

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationProgress {
    pub operation_id: String,
    pub name: String,
    pub state: OperationState,
    pub started_at_millis: i64,
    pub elapsed_ms: u64,
}

struct OperationHandle {
    name: String,
    started: Instant,
    started_at_millis: i64,
    cancel_flag: Arc<AtomicBool>,
    state: OperationState,
}

/// The "operation progress map" from §9: a table guarded by a single mutex,
/// entries keyed by operation id. Cancellation is cooperative — a flag the
/// operation's own wait points check, not a forced abort.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<Mutex<HashMap<String, OperationHandle>>>,
    timeouts_observed: Arc<Mutex<u64>>,
    enabled: bool,
}

impl OperationRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            timeouts_observed: Arc::new(Mutex::new(0)),
            enabled,
        }
    }

    async fn register(&self, name: &str) -> (String, Arc<AtomicBool>) {
        let id = Uuid::new_v4().to_string();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        if self.enabled {
            let mut guard = self.inner.lock().await;
            guard.insert(
                id.clone(),
                OperationHandle {
                    name: name.to_string(),
                    started: Instant::now(),
                    started_at_millis: chrono::Utc::now().timestamp_millis(),
                    cancel_flag: cancel_flag.clone(),
                    state: OperationState::Running,
                },
            );
        }
        (id, cancel_flag)
    }

    async fn finish(&self, id: &str, state: OperationState) {
        if !self.enabled {
            return;
        }
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.get_mut(id) {
            handle.state = state;
        }
    }

    pub async fn progress(&self, id: &str) -> Option<OperationProgress> {
        let guard = self.inner.lock().await;
        guard.get(id).map(|h| OperationProgress {
            operation_id: id.to_string(),
            name: h.name.clone(),
            state: h.state,
            started_at_millis: h.started_at_millis,
            elapsed_ms: h.started.elapsed().as_millis() as u64,
        })
    }

    pub async fn cancel(&self, id: &str) -> bool {
        let guard = self.inner.lock().await;
        if let Some(handle) = guard.get(id) {
            handle.cancel_flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub async fn timeout_count(&self) -> u64 {
        *self.timeouts_observed.lock().await
    }

    async fn record_timeout(&self) {
        let mut count = self.timeouts_observed.lock().await;
        *count += 1;
    }

    /// Wraps `fut` in a named, tracked operation with the given deadline. On
    /// deadline, the wrapping transaction (inside `fut`) rolls back because the
    /// future is simply dropped — partial progress is never persisted.
    pub async fn run<F, T>(
        &self,
        name: &str,
        deadline: Duration,
        fut: F,
    ) -> Result<T, EngineError>
    where
        F: std::future::Future<Output = Result<T, EngineError>>,
    {
        let (id, _cancel_flag) = self.register(name).await;
        let started = Instant::now();

        match timeout(deadline, fut).await {
            Ok(Ok(value)) => {
                self.finish(&id, OperationState::Completed).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.finish(&id, OperationState::Failed).await;
                Err(e)
            }
            Err(_) => {
                self.finish(&id, OperationState::TimedOut).await;
                self.record_timeout().await;
                Err(EngineError::Timeout {
                    operation_id: id,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_times_out_and_reports_it() {
        let registry = OperationRegistry::new(true);
        let result = registry
            .run("slow-op", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, EngineError>(())
            })
            .await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
        assert_eq!(registry.timeout_count().await, 1);
    }

    #[tokio::test]
    async fn run_completes_within_deadline() {
        let registry = OperationRegistry::new(true);
        let result = registry
            .run("fast-op", Duration::from_millis(500), async { Ok::<_, EngineError>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
