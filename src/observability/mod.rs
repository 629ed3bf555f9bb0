//! 可观测性：tracing 订阅器初始化
//!
//! RUST_LOG 优先；未设置时使用命令行给出的级别。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()?;
    Ok(())
}
