// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// - StillImageSource:    固定帧率重复单幅图片
/// - ImageSequenceSource: 回放目录中的录制帧
/// - FfmpegSource:        摄像头/视频文件/RTSP (ffmpeg 特性)
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod sequence;
pub mod still;
pub mod yuv;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::RgbImage;

use crate::error::Result;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegInput, FfmpegSource};
pub use sequence::ImageSequenceSource;
pub use still::StillImageSource;

/// 图片源默认帧间隔 (25fps)
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(40);

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// 帧源: 生产线程逐帧拉取
pub trait FrameSource: Send {
    /// 下一帧; `Ok(None)` 表示源已结束
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// 帧间隔; `None` 表示源按自身速率阻塞产出
    fn frame_interval(&self) -> Option<Duration>;

    fn describe(&self) -> String;

    /// 流水线停止标志; 阻塞读帧的源应据此提前返回 `Ok(None)`
    fn attach_shutdown(&mut self, _shutdown: Arc<AtomicBool>) {}
}

/// 分片等待时每片时长
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// 分片等待结果
#[derive(Debug, PartialEq)]
pub(crate) enum Wait<T> {
    Ready(T),
    /// 停止标志已置位
    Cancelled,
    TimedOut,
    Disconnected,
}

/// 等待通道中的下一项, 每片检查一次停止标志
#[cfg_attr(not(feature = "ffmpeg"), allow(dead_code))]
pub(crate) fn wait_next<T>(
    rx: &Receiver<T>,
    limit: Duration,
    shutdown: Option<&AtomicBool>,
) -> Wait<T> {
    let deadline = Instant::now() + limit;
    loop {
        if shutdown.is_some_and(|s| s.load(Ordering::SeqCst)) {
            return Wait::Cancelled;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Wait::TimedOut;
        }
        match rx.recv_timeout(left.min(WAIT_SLICE)) {
            Ok(item) => return Wait::Ready(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Wait::Disconnected,
        }
    }
}

pub(crate) fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// 根据源字符串选择实现
///
/// 目录 → 图片序列; 图片文件 → 静态图片; 其他交给 ffmpeg (摄像头序号、视频文件、流地址)
pub fn open_source(spec: &str) -> Result<Box<dyn FrameSource>> {
    let path = Path::new(spec);
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path, DEFAULT_FRAME_INTERVAL)?));
    }
    if is_image_file(path) {
        return Ok(Box::new(StillImageSource::open(path, DEFAULT_FRAME_INTERVAL)?));
    }
    open_stream(spec)
}

#[cfg(feature = "ffmpeg")]
fn open_stream(spec: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(FfmpegSource::open(spec)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_stream(spec: &str) -> Result<Box<dyn FrameSource>> {
    Err(crate::error::SentinelError::Source(format!(
        "无法打开 {:?}: 摄像头与视频流需要启用 ffmpeg 特性",
        spec
    )))
}
