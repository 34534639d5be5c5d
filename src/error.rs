// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误处理模块 (Error taxonomy)
//!
//! 单帧错误(渲染、识别)降级处理,控制操作错误(重配置、启动)显式返回给调用方

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    /// 配置非法: 互斥的可视化选项、越界阈值等,在应用配置的调用处同步失败
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("队列已满")]
    QueueFull,

    #[error("等待超时")]
    Timeout,

    #[error("阶段已停止")]
    Stopped,

    /// 非致命: 轨迹保持 "Unknown",后续帧可重试
    #[error("识别超时 (track {0})")]
    RecognitionTimeout(String),

    /// 重配置期间加速器失败: 对引擎实例是致命的
    #[error("加速器错误: {0}")]
    Accelerator(String),

    #[error("渲染失败: {0}")]
    Render(String),

    #[error("视频源错误: {0}")]
    Source(String),

    #[error("人脸库错误: {0}")]
    Gallery(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("图像错误: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("张量形状错误: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl SentinelError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn accelerator(msg: impl Into<String>) -> Self {
        Self::Accelerator(msg.into())
    }

    /// 可恢复错误: 调用方自行决定重试、丢弃或退避
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::Timeout | Self::RecognitionTimeout(_) | Self::Render(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
