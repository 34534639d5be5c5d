// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 视频处理流水线 (Video Processing Pipeline)
//!
//! 每个阶段一个线程, 阶段之间只通过有界队列通信:
//! - Producer: 帧源 → 推理引擎输入队列
//! - Tracker:  推理引擎输出 → 跟踪 → 轨迹表 → 识别队列 / 跟踪帧队列
//! - Recognition: 见 `recognition::Recognizer`
//! - 事件循环 (调用线程): 告警评估 + 身份叠加 + 输出
//!
//! 停止顺序: Producer → 引擎 → Tracker → 识别线程

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::alert::{ActiveAlert, AlertEngine, AlertEvent};
use crate::config::{PipelineConfig, VisualizationFlags};
use crate::detection::tracker::{IouTracker, TrackUpdate};
use crate::detection::types::{AnnotatedFrame, BBox, Frame, RenderStatus};
use crate::engine::{InferenceEngine, ReconfigureTimings};
use crate::error::{Result, SentinelError};
use crate::input::FrameSource;
use crate::recognition::{
    Embedder, Gallery, RecognitionHandle, Recognizer, TrackRegistry, TrackedObject,
};
use crate::render::{overlay_alert, overlay_tracks, LabelFont};

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);
const PAUSE_POLL: Duration = Duration::from_millis(20);
/// 事件循环刷新间隔 (暂停时按此频率重绘最后一帧)
const REFRESH_INTERVAL: Duration = Duration::from_millis(40);

// ========== 共享上下文 ==========

/// 流水线上下文: 构造一次, 传给每个阶段
pub struct PipelineContext {
    config: RwLock<Arc<PipelineConfig>>,
    engine: InferenceEngine,
    registry: Arc<TrackRegistry>,
    gallery: Arc<Gallery>,
    recognizer: Recognizer,
    font: Option<Arc<LabelFont>>,
    paused: AtomicBool,
    // 与帧源共享, 阻塞读帧时也能及时退出
    shutdown: Arc<AtomicBool>,
    source_finished: AtomicBool,
}

impl PipelineContext {
    /// 启动识别线程并组装上下文 (标签字体沿用引擎已加载的实例)
    pub fn new(
        config: PipelineConfig,
        engine: InferenceEngine,
        gallery: Arc<Gallery>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(TrackRegistry::new());
        let recognizer = Recognizer::start(
            registry.clone(),
            gallery.clone(),
            embedder,
            config.queues.recognition,
            config.recognition.margin,
            config.thresholds.match_threshold,
        )?;
        let font = engine.font();
        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            engine,
            registry,
            gallery,
            recognizer,
            font,
            paused: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            source_finished: AtomicBool::new(false),
        }))
    }

    /// 当前配置快照
    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.read().clone()
    }

    fn update_config(&self, f: impl FnOnce(&mut PipelineConfig)) {
        let mut guard = self.config.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<TrackRegistry> {
        &self.registry
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    pub fn recognition(&self) -> RecognitionHandle {
        self.recognizer.handle()
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("收到停止请求");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_source_finished(&self) -> bool {
        self.source_finished.load(Ordering::SeqCst)
    }

    /// 手动登记 (阻塞直到完成或超时)
    pub fn enroll(&self, name: &str, image: &RgbImage, bbox: Option<BBox>) -> Result<PathBuf> {
        let timeout = Duration::from_millis(self.config().recognition.enroll_timeout_ms);
        self.recognition().enroll(name, image, bbox, timeout)
    }

    /// 启动时登记搜索目标: 单次检测取置信度最高的框, 无检测时使用整幅图像
    pub fn seed_target(&self, name: &str, image: &RgbImage) -> Result<PathBuf> {
        let detections = match self.engine.detect_once(image) {
            Ok(d) => d,
            Err(e) => {
                warn!("⚠️ 目标图片检测失败, 使用整幅图像: {}", e);
                Vec::new()
            }
        };
        let bbox = detections
            .iter()
            .max_by(|a, b| a.confidence().total_cmp(&b.confidence()))
            .map(|d| d.bbox);
        match &bbox {
            Some(b) => info!(
                "🎯 目标 {} 使用检测框 ({:.0},{:.0} {:.0}x{:.0})",
                name,
                b.x(),
                b.y(),
                b.width(),
                b.height()
            ),
            None => info!("🎯 目标 {} 未检测到对象, 使用整幅图像", name),
        }
        self.enroll(name, image, bbox)
    }

    pub fn seed_target_file(&self, name: &str, path: impl AsRef<Path>) -> Result<PathBuf> {
        let image = image::open(path.as_ref())?.to_rgb8();
        self.seed_target(name, &image)
    }
}

// ========== 阶段间数据 ==========

/// 跟踪后的帧 (Tracker → 事件循环)
#[derive(Clone)]
pub struct TrackedFrame {
    pub annotated: AnnotatedFrame,
    /// 跟踪完成时的轨迹快照
    pub tracks: Vec<TrackedObject>,
}

/// 合成后的输出帧
pub struct ComposedFrame {
    pub seq: u64,
    pub image: RgbImage,
    pub tracks: Vec<TrackedObject>,
    pub alert: Option<ActiveAlert>,
    pub events: Vec<AlertEvent>,
    pub render: RenderStatus,
    pub generation: u64,
    /// 暂停期间的重绘
    pub repeated: bool,
}

/// 输出端 (显示、录制等)
pub trait FrameSink {
    fn present(&mut self, frame: &ComposedFrame) -> Result<()>;
}

/// 丢弃输出, 只计数
#[derive(Default)]
pub struct NullSink {
    presented: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &ComposedFrame) -> Result<()> {
        self.presented += 1;
        Ok(())
    }
}

/// 告警期间把合成帧写入目录
pub struct SnapshotSink {
    dir: PathBuf,
    saved: usize,
}

impl SnapshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, saved: 0 })
    }

    pub fn saved(&self) -> usize {
        self.saved
    }
}

impl FrameSink for SnapshotSink {
    fn present(&mut self, frame: &ComposedFrame) -> Result<()> {
        if frame.alert.is_none() || frame.repeated {
            return Ok(());
        }
        let path = self
            .dir
            .join(format!("{}_{}.jpg", crate::gen_time_string("-"), frame.seq));
        frame.image.save(&path)?;
        self.saved += 1;
        debug!("📸 告警快照 {}", path.display());
        Ok(())
    }
}

// ========== 流水线 ==========

pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    alert: Mutex<AlertEngine>,
    tracked_rx: Receiver<TrackedFrame>,
    producer: Mutex<Option<JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Pipeline {
    /// 启动生产线程与跟踪线程
    pub fn start(ctx: Arc<PipelineContext>, mut source: Box<dyn FrameSource>) -> Result<Self> {
        let config = ctx.config();
        let (tracked_tx, tracked_rx) = bounded(config.queues.tracked.max(1));

        let mut alert = AlertEngine::new(config.alert_duration());
        alert.set_search_targets(ctx.gallery.names());

        info!("🎬 视频源: {}", source.describe());
        source.attach_shutdown(ctx.shutdown.clone());
        let producer = {
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name("sentinel-producer".to_string())
                .spawn(move || produce(ctx, source))?
        };
        let consumer = {
            let ctx = ctx.clone();
            let params = config.tracker.clone();
            std::thread::Builder::new()
                .name("sentinel-tracker".to_string())
                .spawn(move || consume(ctx, IouTracker::new(params), tracked_tx))?
        };

        Ok(Self {
            ctx,
            alert: Mutex::new(alert),
            tracked_rx,
            producer: Mutex::new(Some(producer)),
            consumer: Mutex::new(Some(consumer)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// 事件循环: 告警评估 + 身份叠加 + 输出, 在调用线程上运行
    ///
    /// 停止请求或上游结束时返回; 加速器失效导致上游结束时返回 `Accelerator` 错误
    pub fn run_event_loop(&self, sink: &mut dyn FrameSink) -> Result<u64> {
        let mut last: Option<TrackedFrame> = None;
        let mut presented = 0u64;

        while !self.ctx.is_shutdown_requested() {
            let (tracked, repeated) = match self.tracked_rx.recv_timeout(REFRESH_INTERVAL) {
                Ok(tracked) => (tracked, false),
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    self.alert.lock().tick(now);
                    match (&last, self.is_paused()) {
                        (Some(prev), true) => (prev.clone(), true),
                        _ => continue,
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("跟踪线程已结束, 事件循环退出");
                    break;
                }
            };

            let composed = self.compose(&tracked, repeated);
            if let Err(e) = sink.present(&composed) {
                warn!("⚠️ 输出失败 (帧 {}): {}", composed.seq, e);
            }
            presented += 1;
            last = Some(tracked);
        }
        info!("事件循环结束, 共输出 {} 帧", presented);
        if let Some(reason) = self.ctx.engine.failure() {
            error!("❌ 加速器失效, 流水线无法继续: {}", reason);
            return Err(SentinelError::accelerator(reason));
        }
        Ok(presented)
    }

    fn compose(&self, tracked: &TrackedFrame, repeated: bool) -> ComposedFrame {
        let now = Instant::now();
        // 框位置取本帧跟踪时的快照; 重绘时姓名取轨迹表最新值
        let tracks = if repeated {
            self.refresh_identities(&tracked.tracks)
        } else {
            tracked.tracks.clone()
        };
        let (events, alert, targets) = {
            let mut alert = self.alert.lock();
            let events = alert.evaluate(&tracks, now);
            (events, alert.current().cloned(), alert.targets().clone())
        };

        let mut image = (*tracked.annotated.image).clone();
        let font = self.ctx.font.as_deref();
        overlay_tracks(&mut image, &tracks, &targets, font);
        if let Some(active) = &alert {
            overlay_alert(&mut image, &active.message, font);
        }

        ComposedFrame {
            seq: tracked.annotated.seq(),
            image,
            tracks,
            alert,
            events,
            render: tracked.annotated.render.clone(),
            generation: tracked.annotated.generation,
            repeated,
        }
    }

    fn refresh_identities(&self, tracks: &[TrackedObject]) -> Vec<TrackedObject> {
        tracks
            .iter()
            .map(|t| {
                let mut t = t.clone();
                if let Some(latest) = self.ctx.registry.get(t.key) {
                    t.name = latest.name;
                    t.distance = latest.distance;
                    t.state = latest.state;
                    t.embedding = latest.embedding;
                }
                t
            })
            .collect()
    }

    // ========== 控制 ==========

    /// 暂停生产 (不拆除任何阶段)
    pub fn pause(&self) {
        if !self.ctx.paused.swap(true, Ordering::SeqCst) {
            info!("⏸️ 已暂停");
        }
    }

    pub fn resume(&self) {
        if self.ctx.paused.swap(false, Ordering::SeqCst) {
            info!("▶️ 已恢复");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.paused.load(Ordering::SeqCst)
    }

    pub fn set_search_targets<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alert.lock().set_search_targets(names);
    }

    pub fn search_targets(&self) -> HashSet<String> {
        self.alert.lock().targets().clone()
    }

    pub fn current_alert(&self) -> Option<ActiveAlert> {
        self.alert.lock().current().cloned()
    }

    /// 切换检测类别, 成功后替换配置快照
    pub fn reconfigure(&self, classes: &[String]) -> Result<ReconfigureTimings> {
        let timings = self.ctx.engine.reconfigure(classes)?;
        let classes = self.ctx.engine.classes().to_vec();
        self.ctx.update_config(|c| {
            c.classes = classes;
            c.selected_classes.clear();
        });
        Ok(timings)
    }

    pub fn set_thresholds(&self, confidence: f32, iou: f32) -> Result<()> {
        self.ctx.engine.set_thresholds(confidence, iou)?;
        self.ctx.update_config(|c| {
            c.thresholds.confidence = confidence;
            c.thresholds.iou = iou;
        });
        Ok(())
    }

    /// 更新可视化选项 (非法组合同步失败, 不生效)
    pub fn set_visualization(&self, flags: VisualizationFlags) -> Result<()> {
        flags.validate()?;
        self.ctx.update_config(|c| c.visualization = flags);
        Ok(())
    }

    pub fn enroll(&self, name: &str, image: &RgbImage, bbox: Option<BBox>) -> Result<PathBuf> {
        self.ctx.enroll(name, image, bbox)
    }

    pub fn seed_target(&self, name: &str, image: &RgbImage) -> Result<PathBuf> {
        self.ctx.seed_target(name, image)
    }

    /// 按依赖顺序停止各阶段 (幂等)
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.request_shutdown();

        join_stage("生产线程", &self.producer);
        self.ctx.engine.stop();
        join_stage("跟踪线程", &self.consumer);
        self.ctx.recognizer.stop();
        info!("✅ 流水线已停止");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_stage(name: &str, handle: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(h) = handle.lock().take() {
        if h.join().is_err() {
            error!("❌ {}异常退出", name);
        }
    }
}

// ========== 生产线程 ==========

fn produce(ctx: Arc<PipelineContext>, mut source: Box<dyn FrameSource>) {
    let mut seq = 0u64;
    let mut dropped = 0u64;

    while !ctx.is_shutdown_requested() {
        // 暂停: 每轮检查一次标志
        if ctx.paused.load(Ordering::SeqCst) {
            std::thread::sleep(PAUSE_POLL);
            continue;
        }

        let started = Instant::now();
        let image = match source.next_frame() {
            Ok(Some(image)) => image,
            Ok(None) => {
                info!("视频源结束: {}", source.describe());
                break;
            }
            Err(e) => {
                error!("❌ 视频源错误: {}", e);
                break;
            }
        };

        let config = ctx.config();
        let frame = Frame::new(seq, image);
        seq += 1;
        match ctx
            .engine
            .submit(frame, config.visualization, config.submit_policy())
        {
            Ok(()) => {}
            Err(SentinelError::QueueFull) => {
                dropped += 1;
                if dropped % 100 == 1 {
                    debug!("输入队列已满, 累计丢弃 {} 帧", dropped);
                }
            }
            // 重配置期间拒绝提交
            Err(SentinelError::Stopped) if !ctx.engine.is_stopped() => {
                dropped += 1;
            }
            Err(SentinelError::Stopped) => break,
            Err(SentinelError::Accelerator(e)) => {
                error!("❌ 加速器失效, 停止读帧: {}", e);
                break;
            }
            Err(e) => warn!("⚠️ 提交失败: {}", e),
        }

        if let Some(interval) = source.frame_interval() {
            let elapsed = started.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }

    ctx.source_finished.store(true, Ordering::SeqCst);
    debug!("生产线程退出 (丢弃 {} 帧)", dropped);
}

// ========== 跟踪线程 ==========

fn consume(ctx: Arc<PipelineContext>, mut tracker: IouTracker, tx: Sender<TrackedFrame>) {
    let recognition = ctx.recognition();
    let mut generation = ctx.engine.generation();
    let mut dropped = 0u64;

    loop {
        let annotated = match ctx.engine.receive(RECEIVE_TIMEOUT) {
            Ok(annotated) => annotated,
            Err(SentinelError::Timeout) => {
                if ctx.is_source_finished() && ctx.engine.in_flight() == 0 {
                    break;
                }
                continue;
            }
            Err(SentinelError::Stopped) => break,
            Err(SentinelError::Accelerator(e)) => {
                error!("❌ 加速器失效, 跟踪线程退出: {}", e);
                break;
            }
            Err(e) => {
                warn!("⚠️ 接收推理结果失败: {}", e);
                continue;
            }
        };

        // 类别切换后类别序号含义改变, 重新开始跟踪
        if annotated.generation != generation {
            generation = annotated.generation;
            let removed = ctx
                .registry
                .snapshot_live()
                .iter()
                .filter_map(|t| t.track_id())
                .collect();
            ctx.registry.apply_tracks(
                &TrackUpdate {
                    tracks: Vec::new(),
                    removed,
                },
                annotated.seq(),
            );
            tracker.reset();
            info!("类别已切换 (第 {} 代), 跟踪重置", generation);
        }

        let update = tracker.update(&annotated.detections);
        ctx.registry.apply_tracks(&update, annotated.seq());

        let config = ctx.config();
        let retry_after = Duration::from_millis(config.recognition.retry_after_ms);
        for (key, bbox) in ctx.registry.needs_recognition(Instant::now(), retry_after) {
            match recognition.submit_live(key, annotated.frame.image(), &bbox) {
                Ok(()) => {}
                Err(SentinelError::QueueFull) => {
                    debug!("识别队列已满, 轨迹 {:?} 稍后重试", key);
                }
                Err(e) => warn!("⚠️ 识别提交失败 {:?}: {}", key, e),
            }
        }

        let tracked = TrackedFrame {
            annotated,
            tracks: ctx.registry.snapshot_live(),
        };
        // 队列满时丢弃最新帧
        match tx.try_send(tracked) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => dropped += 1,
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    debug!("跟踪线程退出 (丢弃 {} 帧) | {}", dropped, tracker.stats());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ClassListCompiler, PassThroughAccelerator};
    use crate::input::StillImageSource;
    use crate::recognition::AppearanceEmbedder;
    use image::Rgb;

    fn context(dir: &Path) -> Arc<PipelineContext> {
        let config = PipelineConfig {
            gallery_dir: dir.join("gallery"),
            ..Default::default()
        };
        let engine = InferenceEngine::start(
            Box::new(ClassListCompiler::new(64)),
            Box::new(PassThroughAccelerator::new()),
            &config,
        )
        .unwrap();
        let embedder = Arc::new(AppearanceEmbedder::new());
        let gallery = Arc::new(Gallery::load(&config.gallery_dir, embedder.as_ref(), None).unwrap());
        PipelineContext::new(config, engine, gallery, embedder).unwrap()
    }

    #[test]
    fn test_finite_source_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let source = StillImageSource::new(
            RgbImage::from_pixel(32, 32, Rgb([5, 5, 5])),
            Duration::from_millis(5),
        )
        .with_limit(5);
        let pipeline = Pipeline::start(ctx.clone(), Box::new(source)).unwrap();

        let mut sink = NullSink::new();
        let presented = pipeline.run_event_loop(&mut sink).unwrap();
        assert_eq!(presented, sink.presented());
        assert!(presented >= 1 && presented <= 5);
        assert!(ctx.is_source_finished());

        pipeline.shutdown();
        pipeline.shutdown();
        assert!(ctx.engine().is_stopped());
    }

    #[test]
    fn test_invalid_visualization_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let source = StillImageSource::new(RgbImage::new(8, 8), Duration::from_millis(5)).with_limit(1);
        let pipeline = Pipeline::start(ctx.clone(), Box::new(source)).unwrap();
        let flags = VisualizationFlags {
            remove_background: true,
            blur: true,
            ..Default::default()
        };
        assert!(matches!(
            pipeline.set_visualization(flags),
            Err(SentinelError::Configuration(_))
        ));
        assert!(!ctx.config().visualization.blur);
        pipeline.shutdown();
    }

    #[test]
    fn test_compose_draws_tracks_of_the_same_frame() {
        use crate::detection::tracker::Track;
        use crate::recognition::{TrackKey, UNKNOWN_NAME};

        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let embedder = AppearanceEmbedder::new();
        let face = RgbImage::from_fn(32, 32, |x, y| Rgb([x as u8 * 7, y as u8 * 7, 40]));
        let embedding = embedder.embed(&face).unwrap();
        ctx.gallery().add("Alice", &face, &embedding).unwrap();

        let source = StillImageSource::new(RgbImage::new(8, 8), Duration::from_millis(5)).with_limit(0);
        let pipeline = Pipeline::start(ctx.clone(), Box::new(source)).unwrap();

        // 轨迹表已前进到后续帧的位置
        let later = BBox::new(40.0, 10.0, 20.0, 20.0, 0.9);
        let update = TrackUpdate {
            tracks: vec![Track {
                id: 1,
                bbox: later,
                class_id: 0,
                label: "person".to_string(),
                keypoints: Vec::new(),
                frames_lost: 0,
                age: 3,
            }],
            removed: Vec::new(),
        };
        ctx.registry().apply_tracks(&update, 5);

        let earlier = BBox::new(10.0, 10.0, 20.0, 20.0, 0.9);
        let image = Arc::new(RgbImage::new(64, 64));
        let tracked = TrackedFrame {
            annotated: AnnotatedFrame {
                frame: Frame::new(3, (*image).clone()),
                detections: Vec::new(),
                image,
                render: RenderStatus::Rendered,
                generation: 0,
                classes: ctx.engine().classes(),
                inference_ms: 0.0,
            },
            tracks: vec![TrackedObject::new(TrackKey::Live(1), earlier, "person", 3)],
        };

        let composed = pipeline.compose(&tracked, false);
        assert_eq!(composed.seq, 3);
        assert_eq!(composed.tracks.len(), 1);
        assert_eq!(composed.tracks[0].bbox.x(), earlier.x());
        assert_eq!(composed.tracks[0].name, UNKNOWN_NAME);

        // 暂停重绘: 框不动, 姓名取识别线程的最新结果
        let snapshot = ctx.gallery().snapshot();
        assert!(ctx
            .registry()
            .record_embedding(TrackKey::Live(1), embedding, &snapshot, 0.4));
        let repeated = pipeline.compose(&tracked, true);
        assert!(repeated.repeated);
        assert_eq!(repeated.tracks[0].bbox.x(), earlier.x());
        assert_eq!(repeated.tracks[0].name, "Alice");
        pipeline.shutdown();
    }

    #[test]
    fn test_seed_target_without_detections_uses_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let image = RgbImage::from_fn(40, 40, |x, y| Rgb([x as u8 * 5, y as u8 * 5, 60]));
        let path = ctx.seed_target("Alice", &image).unwrap();
        assert!(path.exists());
        assert_eq!(ctx.gallery().names(), vec!["Alice".to_string()]);
        assert!(ctx.registry().is_empty());
    }
}
