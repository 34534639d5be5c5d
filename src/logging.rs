// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 日志初始化
//!
//! 控制台输出 + 可选的非阻塞文件输出 (sentinel.log, 按天轮转)

use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SentinelError};

const LOG_FILE_NAME: &str = "sentinel.log";

/// 初始化日志系统
///
/// `RUST_LOG` 优先于 `level`. 返回的 WorkerGuard 必须在 main 中保持存活,
/// 否则文件日志线程会提前退出
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter_string = format!("{},ort=warn", level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_string));

    // 控制台层: 带线程名, 便于区分各阶段
    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_thread_names(true)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SentinelError::config(format!("日志系统已初始化: {}", e)))?;

    Ok(guard)
}
