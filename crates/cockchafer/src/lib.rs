//! Bridge from host programs to XGBoost prediction.
//!
//! The C ABI lives in [`abi`] (header: `include/cockchafer.h`). Rust callers
//! can use the [`registry`] / [`predictor`] types directly, or the async
//! [`pool`] for dedicated inference threads.

pub mod abi;
pub mod config;
pub mod error;
pub mod logging;
pub mod model_dir;
pub mod pool;
pub mod predictor;
pub mod registry;
pub mod util;
