//! Test helpers.

use std::future::Future;

/// Drive `future` to completion on a current-thread runtime inside a
/// `LocalSet`, which is what spawned resolutions need.
pub(crate) fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the test runtime");
    tokio::task::LocalSet::new().block_on(&runtime, future)
}
