//! Bounded task dispatcher
//!
//! Runs an async function over a finite sequence with at most `concurrency`
//! invocations in flight. The first error wins: tasks already running
//! finish, queued items are dropped, and the caller gets that first error.
//! Result order is not guaranteed; callers that care attach their own
//! index.

use crate::VizzlyError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub async fn dispatch_bounded<T, F, Fut, R>(
    items: Vec<T>,
    concurrency: usize,
    f: F,
) -> Result<Vec<R>, VizzlyError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, VizzlyError>> + Send + 'static,
    R: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let f = Arc::new(f);

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let semaphore = semaphore.clone();
        let failed = failed.clone();
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.map_err(VizzlyError::from)?;
            if failed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match f(item).await {
                Ok(result) => Ok(Some(result)),
                Err(e) => {
                    failed.store(true, Ordering::SeqCst);
                    Err(e)
                }
            }
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(Some(result))) => results.push(result),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(VizzlyError::Io(format!("task failed: {}", join_error)));
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
