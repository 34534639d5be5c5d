// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! FFmpeg 视频源 (摄像头 / 视频文件 / RTSP)
//!
//! 解码在 ffmpeg 自己的线程中进行, 帧过滤器把 YUV420P 转成 RGB 后送入有界通道
//! 源被丢弃后通道断开, 过滤器返回错误使 ffmpeg 停止解码
//! 读帧分片等待, 流水线停止时不必等满 `FRAME_WAIT`

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::yuv::{yuv420p_to_rgb, Yuv420Planes};
use super::{wait_next, FrameSource, Wait};
use crate::error::{Result, SentinelError};

const MAX_DIMENSION: u32 = 4096;
const CHANNEL_DEPTH: usize = 2;
/// 等待首帧/下一帧的上限
const FRAME_WAIT: Duration = Duration::from_secs(10);
/// 丢弃源时等待解码线程退出的上限
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// 输入类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfmpegInput {
    /// 本地摄像头 (设备序号)
    Camera(usize),
    /// 视频文件或网络流地址
    Url(String),
}

impl FfmpegInput {
    /// 纯数字视为摄像头序号
    pub fn parse(spec: &str) -> Self {
        match spec.trim().parse::<usize>() {
            Ok(index) => Self::Camera(index),
            Err(_) => Self::Url(spec.to_string()),
        }
    }

    /// 实时源队列满时丢弃最新帧; 文件源阻塞等待消费方
    fn is_live(&self) -> bool {
        match self {
            Self::Camera(_) => true,
            Self::Url(url) => url.starts_with("rtsp://") || url.starts_with("rtmp://"),
        }
    }
}

pub struct FfmpegSource {
    input: FfmpegInput,
    rx: Receiver<RgbImage>,
    error: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl FfmpegSource {
    pub fn open(spec: &str) -> Result<Self> {
        let input = FfmpegInput::parse(spec);
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let error = Arc::new(Mutex::new(None));

        let worker = {
            let input = input.clone();
            let error = error.clone();
            std::thread::Builder::new()
                .name("sentinel-decode".to_string())
                .spawn(move || {
                    if let Err(e) = decode(&input, tx) {
                        warn!("❌ 解码失败 {:?}: {}", input, e);
                        *error.lock() = Some(e.to_string());
                    }
                })?
        };
        info!("🎥 FFmpeg 视频源: {:?}", input);

        Ok(Self {
            input,
            rx,
            error,
            worker: Some(worker),
            shutdown: None,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        match wait_next(&self.rx, FRAME_WAIT, self.shutdown.as_deref()) {
            Wait::Ready(image) => Ok(Some(image)),
            Wait::Cancelled => {
                debug!("停止请求, 放弃等待 {:?}", self.input);
                Ok(None)
            }
            Wait::TimedOut => Err(SentinelError::Source(format!(
                "{:?} 超过 {:?} 没有输出帧",
                self.input, FRAME_WAIT
            ))),
            Wait::Disconnected => match self.error.lock().take() {
                Some(e) => Err(SentinelError::Source(e)),
                None => Ok(None),
            },
        }
    }

    /// 按源的原生速率产生帧
    fn frame_interval(&self) -> Option<Duration> {
        None
    }

    fn describe(&self) -> String {
        match &self.input {
            FfmpegInput::Camera(index) => format!("摄像头 #{}", index),
            FfmpegInput::Url(url) => url.clone(),
        }
    }

    fn attach_shutdown(&mut self, shutdown: Arc<AtomicBool>) {
        self.shutdown = Some(shutdown);
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        // 先断开通道, 过滤器下一帧即退出
        let (_, rx) = bounded(0);
        drop(std::mem::replace(&mut self.rx, rx));
        // 卡住的流 (无新帧) 不会触发过滤器, 超过宽限期后不再等待解码线程
        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + JOIN_GRACE;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                debug!("解码线程仍在等待输入, 不再等待其退出: {:?}", self.input);
            }
        }
    }
}

// ========== 解码 ==========

fn decode(input: &FfmpegInput, tx: Sender<RgbImage>) -> Result<()> {
    let filter = RgbFilter::new(tx, input.is_live());
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("rgb", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let ffmpeg_input = match input {
        FfmpegInput::Camera(index) => {
            let (url, format) = camera_url(*index)?;
            debug!("摄像头地址: {} ({})", url, format);
            Input::new(url).set_format(format)
        }
        FfmpegInput::Url(url) if url.starts_with("rtsp://") => {
            Input::new(url.as_str()).set_input_opts([("rtsp_transport", "tcp")].into())
        }
        FfmpegInput::Url(url) => Input::new(url.as_str()),
    };

    let ctx = FfmpegContext::builder()
        .input(ffmpeg_input)
        .filter_descs(["format=yuv420p"].into())
        .output(out)
        .build()
        .map_err(|e| SentinelError::Source(format!("构建失败: {}", e)))?;
    let sch = ctx
        .start()
        .map_err(|e| SentinelError::Source(format!("启动失败: {}", e)))?;
    info!("✅ 解码启动成功");
    let _ = sch.wait();
    debug!("解码循环结束");
    Ok(())
}

/// 摄像头地址 - 根据平台选择
fn camera_url(index: usize) -> Result<(String, &'static str)> {
    #[cfg(target_os = "windows")]
    {
        let devices = ez_ffmpeg::device::get_input_video_devices()
            .map_err(|e| SentinelError::Source(format!("获取摄像头列表失败: {}", e)))?;
        let name = devices
            .get(index)
            .ok_or_else(|| SentinelError::Source(format!("摄像头 #{} 不存在", index)))?;
        Ok((format!("video={}", name), "dshow"))
    }
    #[cfg(target_os = "macos")]
    {
        Ok((index.to_string(), "avfoundation"))
    }
    #[cfg(target_os = "linux")]
    {
        Ok((format!("/dev/video{}", index), "v4l2"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Ok((index.to_string(), "video4linux2"))
    }
}

/// 帧过滤器: YUV420P → RgbImage → 通道
struct RgbFilter {
    tx: Sender<RgbImage>,
    live: bool,
    count: usize,
    dropped: usize,
    last: Instant,
}

impl RgbFilter {
    fn new(tx: Sender<RgbImage>, live: bool) -> Self {
        Self {
            tx,
            live,
            count: 0,
            dropped: 0,
            last: Instant::now(),
        }
    }

    fn convert(frame: &Frame) -> Result<RgbImage> {
        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            return Err(SentinelError::Source("空帧/损坏帧".to_string()));
        }
        // SAFETY: 指针非空, 平面长度按 ffmpeg 给出的行步长与高度计算
        unsafe {
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as u32, raw.height as u32);
            if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
                return Err(SentinelError::Source(format!("非法分辨率 {}x{}", w, h)));
            }
            // 缺少参考帧、无效比特流
            if raw.decode_error_flags & 0x03 != 0 {
                return Err(SentinelError::Source(format!(
                    "解码错误标志=0x{:02x}",
                    raw.decode_error_flags
                )));
            }
            if raw.data[0].is_null() || raw.data[1].is_null() || raw.data[2].is_null() {
                return Err(SentinelError::Source("YUV指针为空".to_string()));
            }
            if raw.linesize[0] <= 0 || raw.linesize[1] <= 0 || raw.linesize[2] <= 0 {
                return Err(SentinelError::Source("不支持负步长".to_string()));
            }

            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            let uv_rows = (h as usize).div_ceil(2);
            let planes = Yuv420Planes {
                y: std::slice::from_raw_parts(raw.data[0], y_stride * h as usize),
                u: std::slice::from_raw_parts(raw.data[1], uv_stride * uv_rows),
                v: std::slice::from_raw_parts(raw.data[2], uv_stride * uv_rows),
                y_stride,
                uv_stride,
                width: w,
                height: h,
            };
            yuv420p_to_rgb(&planes)
        }
    }
}

impl FrameFilter for RgbFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        debug!("解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        let image = match Self::convert(&frame) {
            Ok(image) => image,
            Err(e) => {
                self.dropped += 1;
                if self.dropped <= 10 {
                    warn!("⚠️ 丢弃帧: {}", e);
                }
                return Ok(None);
            }
        };

        let sent = if self.live {
            match self.tx.try_send(image) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    Ok(())
                }
                Err(TrySendError::Disconnected(_)) => Err(()),
            }
        } else {
            self.tx.send(image).map_err(|_| ())
        };
        if sent.is_err() {
            return Err("视频源已关闭".to_string());
        }

        self.count += 1;
        if self.last.elapsed().as_secs_f64() >= 5.0 {
            let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
            debug!("📺 解码统计: {:.1}fps | 丢弃 {}", fps, self.dropped);
            self.last = Instant::now();
            self.count = 0;
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!("解码线程退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(FfmpegInput::parse("0"), FfmpegInput::Camera(0));
        assert_eq!(
            FfmpegInput::parse("rtsp://cam/stream"),
            FfmpegInput::Url("rtsp://cam/stream".to_string())
        );
        assert!(FfmpegInput::parse("rtsp://cam/stream").is_live());
        assert!(!FfmpegInput::parse("clip.mp4").is_live());
    }

    #[test]
    fn test_stalled_stream_honours_shutdown() {
        use std::sync::atomic::Ordering;

        // 不产出帧的"解码线程", 直到测试结束才退出
        let (_tx, rx) = bounded::<RgbImage>(CHANNEL_DEPTH);
        let (hold_tx, hold_rx) = bounded::<()>(0);
        let worker = std::thread::spawn(move || {
            let _ = hold_rx.recv();
        });
        let mut source = FfmpegSource {
            input: FfmpegInput::parse("rtsp://stalled/stream"),
            rx,
            error: Arc::new(Mutex::new(None)),
            worker: Some(worker),
            shutdown: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        source.attach_shutdown(shutdown.clone());

        let flag = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        assert!(source.next_frame().unwrap().is_none());
        drop(source);
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(hold_tx);
    }
}
