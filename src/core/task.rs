// Background tasks whose failure is only observed by their owner

use anyhow::{Result, anyhow};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Slot<T> = Arc<Mutex<Option<Result<T>>>>;

/// A long-running operation launched without blocking the caller.
///
/// The outcome, including an error, stays inside the task until the owner
/// calls [`AsyncTask::take`] or [`AsyncTask::join`]. Dropping a task that is
/// still running aborts it; dropping one whose error was never retrieved logs
/// that error.
pub struct AsyncTask<T> {
    name: String,
    handle: Option<JoinHandle<()>>,
    slot: Slot<T>,
    retrieved: bool,
}

impl<T: Send + 'static> AsyncTask<T> {
    pub fn spawn<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        let writer = slot.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            *writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        });

        Self {
            name: name.into(),
            handle: Some(handle),
            slot,
            retrieved: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Finished with an error that has not been retrieved yet.
    pub fn is_error(&self) -> bool {
        self.is_finished()
            && matches!(
                &*self.slot.lock().unwrap_or_else(PoisonError::into_inner),
                Some(Err(_))
            )
    }

    /// Collect the outcome if the task is done. Returns `None` while it runs
    /// and after the outcome has been taken once.
    pub fn take(&mut self) -> Option<Result<T>> {
        if self.retrieved || !self.is_finished() {
            return None;
        }
        self.handle = None;
        self.retrieved = true;
        Some(self.take_slot())
    }

    /// Wait for the task and return its outcome.
    pub async fn join(mut self) -> Result<T> {
        if self.retrieved {
            return Err(anyhow!("outcome of task {} was already taken", self.name));
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| anyhow!("task {} did not complete: {}", self.name, e))?;
        }
        self.retrieved = true;
        self.take_slot()
    }

    fn take_slot(&self) -> Result<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| Err(anyhow!("task {} panicked or was aborted", self.name)))
    }
}

impl<T> Drop for AsyncTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && !handle.is_finished()
        {
            debug!("Aborting unfinished task {}", self.name);
            handle.abort();
            return;
        }
        if !self.retrieved
            && let Some(Err(e)) = &*self.slot.lock().unwrap_or_else(PoisonError::into_inner)
        {
            error!("Task {} failed and its error was never retrieved: {:#}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_finished<T: Send + 'static>(task: &AsyncTask<T>) {
        for _ in 0..200 {
            if task.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never finished");
    }

    #[tokio::test]
    async fn test_take_returns_value_once() {
        let mut task = AsyncTask::spawn("value", async { Ok(42u32) });
        wait_finished(&task).await;
        assert!(!task.is_error());
        assert_eq!(task.take().unwrap().unwrap(), 42);
        assert!(task.take().is_none());
    }

    #[tokio::test]
    async fn test_error_is_captured_until_taken() {
        let mut task: AsyncTask<()> = AsyncTask::spawn("failing", async { Err(anyhow!("bad")) });
        wait_finished(&task).await;
        assert!(task.is_error());
        let err = task.take().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "bad");
    }

    #[tokio::test]
    async fn test_take_is_none_while_running() {
        let mut task = AsyncTask::spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(!task.is_finished());
        assert!(task.take().is_none());
    }

    #[tokio::test]
    async fn test_join_waits() {
        let task = AsyncTask::spawn("join", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("done".to_string())
        });
        assert_eq!(task.join().await.unwrap(), "done");
    }
}
