//! 可观测性：tracing 初始化
//!
//! 默认 info 级别，RUST_LOG 可覆盖；--verbose 提升到 debug。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
