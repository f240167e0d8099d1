//! Tools for limiting the number of concurrent CPU-bound external processes.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftoppm` and
/// `tesseract` processes across all jobs.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// Each external rasterizer or OCR process will happily use a whole core, so
/// running many jobs with many pages at once would otherwise oversubscribe
/// the machine badly.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> R
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    // The semaphore is never closed, so this only fails if that changes.
    let permit = CPU_SEMAPHORE.acquire().await.ok();
    if permit.is_none() {
        warn!("CPU semaphore closed; running without a permit");
    }
    let result = f().await;
    drop(permit);
    result
}
