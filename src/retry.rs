use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoffBuilder, future::retry};
use tracing::warn;

use crate::error::{LoaderError, Result};

/// Runs `operation` under exponential backoff, giving up once `window` of
/// wall-clock time has elapsed. Batch writes must not retry forever; a chunk
/// that cannot be written inside the window is reported as failed and the
/// load moves on.
pub async fn execute_with_retry<F, Fut, T,>(operation: F, window: Duration,) -> Result<T,>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, backoff::Error<LoaderError,>,>,>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(window,),)
        .build();

    retry(backoff, operation,).await
}

pub fn transient_error(err: LoaderError,) -> backoff::Error<LoaderError,> {
    warn!("Transient error encountered, retrying: {}", err);
    backoff::Error::transient(err,)
}

pub fn permanent_error(err: LoaderError,) -> backoff::Error<LoaderError,> {
    backoff::Error::permanent(err,)
}

/// Routes an error to transient or permanent based on
/// [`LoaderError::is_transient`].
pub fn wrap_error(err: LoaderError,) -> backoff::Error<LoaderError,> {
    if err.is_transient() {
        transient_error(err,)
    } else {
        permanent_error(err,)
    }
}
