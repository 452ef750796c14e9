use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::protocol::{LodestarError, Result};

/// Runs `future` until it completes or `cancel` fires.
///
/// The future is dropped on cancellation, so only work that may be abandoned
/// at any await point belongs here.
pub async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LodestarError::Cancelled),
        output = future => Ok(output),
    }
}
