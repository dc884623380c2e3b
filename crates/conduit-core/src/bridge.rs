//! Runs async work from synchronous call sites.
//!
//! The bridge owns a long-lived multi-thread runtime. Work is spawned onto
//! that runtime and the caller blocks on the join handle, so the caller's
//! own scheduler (if any) is never re-entered.

use std::any::Any;
use std::future::Future;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::debug;

/// Failures of the bridge itself; errors produced by the work are returned
/// inside the successful result unchanged.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start bridge runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("bridged task panicked: {0}")]
    Panicked(String),

    #[error("bridged task was cancelled")]
    Cancelled,
}

/// Synchronous entry point into async code.
pub struct TaskBridge {
    runtime: Option<Runtime>,
}

impl TaskBridge {
    /// Starts the bridge runtime.
    pub fn new() -> Result<Self, BridgeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("conduit-bridge")
            .enable_all()
            .build()?;
        Ok(Self { runtime: Some(runtime) })
    }

    /// Handle to the bridge runtime.
    pub fn handle(&self) -> Option<&Handle> {
        self.runtime.as_ref().map(Runtime::handle)
    }

    /// Runs `future` to completion on the bridge runtime and blocks the
    /// calling thread until it finishes. There is no cancellation.
    pub fn run<F, T>(&self, future: F) -> Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle().ok_or(BridgeError::Cancelled)?;
        let task = handle.spawn(future);
        let wait = move || futures::executor::block_on(task);

        let joined = match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                debug!("Bridging from a runtime worker");
                tokio::task::block_in_place(wait)
            }
            _ => wait(),
        };

        joined.map_err(|e| {
            if e.is_panic() {
                BridgeError::Panicked(panic_message(e.into_panic()))
            } else {
                BridgeError::Cancelled
            }
        })
    }
}

impl Drop for TaskBridge {
    fn drop(&mut self) {
        // Blocking shutdown would panic when dropped inside another runtime.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_from_plain_thread() {
        let bridge = TaskBridge::new().unwrap();
        let value = bridge
            .run(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                21 * 2
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_inner_errors_surface_unchanged() {
        let bridge = TaskBridge::new().unwrap();
        let result: Result<Result<(), String>, BridgeError> =
            bridge.run(async { Err("remote agent unreachable".to_string()) });
        assert_eq!(result.unwrap().unwrap_err(), "remote agent unreachable");
    }

    #[test]
    fn test_panic_becomes_error() {
        let bridge = TaskBridge::new().unwrap();
        let result: Result<(), BridgeError> = bridge.run(async { panic!("handshake exploded") });
        match result.unwrap_err() {
            BridgeError::Panicked(msg) => assert!(msg.contains("handshake exploded")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bridge.run(async { 1 }).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_from_multi_thread_worker() {
        let bridge = TaskBridge::new().unwrap();
        assert_eq!(bridge.run(async { "ok" }).unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_run_and_drop_inside_current_thread_runtime() {
        let bridge = TaskBridge::new().unwrap();
        assert_eq!(bridge.run(async { 7 }).unwrap(), 7);
        drop(bridge);
    }
}
