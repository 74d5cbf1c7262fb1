//! Numeric building blocks of the corrgraph pipeline.
//!
//! - [`batching`]: near-equal batch sizes, batch ranges and the bin schedule
//! - [`correlation`]: per-sample moments, centered Pearson blocks, diagonal masks
//! - [`topk`]: running top-k rows and block merges
//!
//! Nothing here does I/O or communication; the `corrgraph` crate drives these
//! kernels from workers and the aggregator.

pub mod batching;
pub mod correlation;
pub mod topk;


#[cfg(test)]
pub(crate) fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("debug");
        let _ = env_logger::Builder::from_env(env).is_test(true).try_init();
    });
}
