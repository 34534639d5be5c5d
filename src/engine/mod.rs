// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理引擎 (InferenceEngine)
//!
//! 职责: 有界输入队列 → 预处理 → 加速器推理 → 解码 → 合成渲染 → 有界输出队列
//!
//! 在线重配置 (五步, 全程持有重配置锁):
//! 1. 停止接收新帧
//! 2. 排空: 丢弃所有在途结果直到计数归零
//! 3. 按新类别重建模型产物
//! 4. 断开并重连加速器
//! 5. 恢复接收

pub mod accelerator;
#[cfg(feature = "ort-backend")]
pub mod ort_backend;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{validate_prompt, PipelineConfig, SubmitPolicy, VisualizationFlags};
use crate::detection::types::{AnnotatedFrame, Detection, Frame, RenderStatus};
use crate::error::{Result, SentinelError};
use crate::models::{decode, preprocess, DecodeThresholds};
use crate::render::{self, LabelFont};

pub use accelerator::{
    artifact_file_name, Accelerator, ClassListCompiler, ExportCommand, ModelArtifact,
    ModelCompiler, PassThroughAccelerator, PrebuiltArtifacts,
};

/// 排空时单次等待时长
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// 一次重配置各步骤耗时
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconfigureTimings {
    pub drain: Duration,
    pub drained_frames: usize,
    pub rebuild: Duration,
    pub reconnect: Duration,
    pub total: Duration,
}

struct EngineRequest {
    frame: Frame,
    flags: VisualizationFlags,
}

enum EngineMsg {
    Frame(EngineRequest),
    Shutdown,
}

/// 当前生效的类别配置
struct ActiveModel {
    classes: Arc<[String]>,
    /// 每次成功重配置 +1
    generation: u64,
    /// 需要绘制的类别 (为空表示全部)
    selected: Vec<String>,
}

/// 工作线程与控制方共享的状态
struct EngineShared {
    accelerator: Mutex<Box<dyn Accelerator>>,
    model: RwLock<ActiveModel>,
    thresholds: RwLock<DecodeThresholds>,
    font: Option<Arc<LabelFont>>,
    input_size: u32,
}

pub struct InferenceEngine {
    input_tx: Sender<EngineMsg>,
    output_rx: Receiver<AnnotatedFrame>,
    shared: Arc<EngineShared>,
    compiler: Mutex<Box<dyn ModelCompiler>>,

    // 重配置锁: submit 取读锁 (try), 重配置/停止取写锁
    gate: RwLock<()>,
    // 排空期间持有, 消费方的 receive 此时返回 Timeout
    recv_lock: Mutex<()>,

    accepting: AtomicBool,
    stopped: AtomicBool,
    failed: AtomicBool,
    // 加速器失效原因 (致命, 之后所有调用都返回该错误)
    failure: Mutex<Option<String>>,
    in_flight: AtomicUsize,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceEngine {
    /// 构建初始产物、连接加速器并启动工作线程
    pub fn start(
        mut compiler: Box<dyn ModelCompiler>,
        mut accelerator: Box<dyn Accelerator>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let classes: Vec<String> = config
            .classes
            .iter()
            .map(|c| validate_prompt(c))
            .collect::<Result<_>>()?;

        let artifact = compiler.compile(&classes)?;
        accelerator.connect(&artifact)?;
        info!(
            "✅ 加速器 {} 已连接, 类别 {:?}",
            accelerator.name(),
            artifact.classes
        );

        let font = LabelFont::from_config(config)?;
        let shared = Arc::new(EngineShared {
            accelerator: Mutex::new(accelerator),
            model: RwLock::new(ActiveModel {
                classes: artifact.classes.clone(),
                generation: 0,
                selected: config.selected_classes.clone(),
            }),
            thresholds: RwLock::new(DecodeThresholds {
                confidence: config.thresholds.confidence,
                iou: config.thresholds.iou,
            }),
            font,
            input_size: artifact.input_size,
        });

        let (input_tx, input_rx) = bounded(config.queues.input.max(1));
        let (output_tx, output_rx) = bounded(config.queues.output.max(1));

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("sentinel-engine".to_string())
                .spawn(move || engine_loop(input_rx, output_tx, shared))?
        };
        info!(
            "🔍 推理引擎启动 (输入队列 {}, 输出队列 {})",
            config.queues.input, config.queues.output
        );

        Ok(Self {
            input_tx,
            output_rx,
            shared,
            compiler: Mutex::new(compiler),
            gate: RwLock::new(()),
            recv_lock: Mutex::new(()),
            accepting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// 提交一帧
    ///
    /// 非法可视化选项同步返回 `Configuration`; 重配置或停止期间返回 `Stopped`;
    /// 加速器失效后返回 `Accelerator`
    pub fn submit(&self, frame: Frame, flags: VisualizationFlags, policy: SubmitPolicy) -> Result<()> {
        flags.validate()?;

        let Some(_gate) = self.gate.try_read() else {
            return Err(SentinelError::Stopped);
        };
        self.check_failed()?;
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SentinelError::Stopped);
        }

        // 先计数再入队, 避免 receive 先于计数
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let msg = EngineMsg::Frame(EngineRequest { frame, flags });
        let result = match policy {
            SubmitPolicy::Block(timeout) => {
                self.input_tx.send_timeout(msg, timeout).map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => SentinelError::QueueFull,
                    SendTimeoutError::Disconnected(_) => SentinelError::Stopped,
                })
            }
            SubmitPolicy::Fail => self.input_tx.try_send(msg).map_err(|e| match e {
                TrySendError::Full(_) => SentinelError::QueueFull,
                TrySendError::Disconnected(_) => SentinelError::Stopped,
            }),
        };
        if result.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// 取一帧结果
    ///
    /// 重配置排空期间返回 `Timeout`; 无在途帧时, 加速器失效返回 `Accelerator`,
    /// 已停止返回 `Stopped`
    pub fn receive(&self, timeout: Duration) -> Result<AnnotatedFrame> {
        let deadline = Instant::now() + timeout;
        let Some(_recv) = self.recv_lock.try_lock_for(timeout) else {
            return Err(SentinelError::Timeout);
        };
        match self
            .output_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            Ok(frame) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.in_flight() > 0 {
                    return Err(SentinelError::Timeout);
                }
                self.check_failed()?;
                if self.stopped.load(Ordering::SeqCst) {
                    Err(SentinelError::Stopped)
                } else {
                    Err(SentinelError::Timeout)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(SentinelError::Stopped),
        }
    }

    /// 热切换检测类别
    ///
    /// 产物构建失败时恢复旧配置并返回错误; 加速器重连失败后引擎永久失效
    pub fn reconfigure(&self, classes: &[String]) -> Result<ReconfigureTimings> {
        let classes: Vec<String> = classes
            .iter()
            .map(|c| validate_prompt(c))
            .collect::<Result<_>>()?;
        if classes.is_empty() {
            return Err(SentinelError::config("类别列表不能为空"));
        }
        self.check_failed()?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SentinelError::Stopped);
        }

        let started = Instant::now();
        let mut timings = ReconfigureTimings::default();
        info!("🔄 重配置开始: {:?}", classes);

        // 1. 停止接收
        self.accepting.store(false, Ordering::SeqCst);
        let _gate = self.gate.write();

        // 2. 排空
        let t = Instant::now();
        timings.drained_frames = self.drain();
        timings.drain = t.elapsed();

        // 3. 重建产物
        let t = Instant::now();
        let artifact = match self.compiler.lock().compile(&classes) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("⚠️ 产物构建失败, 保持原类别: {}", e);
                self.accepting.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        timings.rebuild = t.elapsed();

        // 4. 重连加速器
        let t = Instant::now();
        {
            let mut accelerator = self.shared.accelerator.lock();
            accelerator.disconnect();
            if let Err(e) = accelerator.connect(&artifact) {
                error!("❌ 加速器重连失败, 引擎停止服务: {}", e);
                *self.failure.lock() = Some(e.to_string());
                self.failed.store(true, Ordering::SeqCst);
                return Err(SentinelError::accelerator(e.to_string()));
            }
        }
        timings.reconnect = t.elapsed();

        // 5. 恢复
        {
            let mut model = self.shared.model.write();
            model.classes = artifact.classes.clone();
            model.generation += 1;
            model.selected.clear();
        }
        self.accepting.store(true, Ordering::SeqCst);
        timings.total = started.elapsed();

        info!(
            "✅ 重配置完成 (第 {} 代): 排空 {} 帧 {:.1}ms | 构建 {:.1}ms | 重连 {:.1}ms | 总计 {:.1}ms",
            self.generation(),
            timings.drained_frames,
            ms(timings.drain),
            ms(timings.rebuild),
            ms(timings.reconnect),
            ms(timings.total),
        );
        Ok(timings)
    }

    /// 同步单次检测 (不经过队列, 不渲染)
    ///
    /// 用于启动时的目标登记; 重配置期间返回 `Stopped`
    pub fn detect_once(&self, image: &image::RgbImage) -> Result<Vec<Detection>> {
        self.check_failed()?;
        let Some(_gate) = self.gate.try_read() else {
            return Err(SentinelError::Stopped);
        };
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SentinelError::Stopped);
        }
        let classes = self.classes();
        let thresholds = *self.shared.thresholds.read();
        let (xs, geometry) = preprocess(image, self.shared.input_size)?;
        let raw = self.shared.accelerator.lock().run(xs)?;
        decode(&raw, thresholds, &geometry, &classes)
    }

    /// 更新后处理阈值, 对之后处理的帧生效
    pub fn set_thresholds(&self, confidence: f32, iou: f32) -> Result<()> {
        for (name, v) in [("confidence", confidence), ("iou", iou)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(SentinelError::config(format!("{} 必须在 [0,1], 当前 {}", name, v)));
            }
        }
        *self.shared.thresholds.write() = DecodeThresholds { confidence, iou };
        debug!("阈值更新: conf={:.2} iou={:.2}", confidence, iou);
        Ok(())
    }

    /// 设置绘制类别 (必须是当前激活类别的子集, 为空表示全部)
    pub fn set_selected_classes(&self, selected: &[String]) -> Result<()> {
        let mut model = self.shared.model.write();
        if let Some(bad) = selected.iter().find(|s| !model.classes.contains(*s)) {
            return Err(SentinelError::config(format!("{} 不是有效类别", bad)));
        }
        model.selected = selected.to_vec();
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn classes(&self) -> Arc<[String]> {
        self.shared.model.read().classes.clone()
    }

    pub fn generation(&self) -> u64 {
        self.shared.model.read().generation
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 标签字体 (启动时加载一次, 与流水线叠加层共用)
    pub fn font(&self) -> Option<Arc<LabelFont>> {
        self.shared.font.clone()
    }

    /// 加速器重连失败后为 true, 引擎不再恢复
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// 加速器失效原因
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn check_failed(&self) -> Result<()> {
        if !self.is_failed() {
            return Ok(());
        }
        let reason = self.failure().unwrap_or_else(|| "引擎已失效".to_string());
        Err(SentinelError::accelerator(reason))
    }

    /// 停止引擎 (幂等): 排空 → 终止消息 → 等待线程 → 断开加速器
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accepting.store(false, Ordering::SeqCst);
        let _gate = self.gate.write();

        let drained = self.drain();
        if drained > 0 {
            debug!("停止时丢弃 {} 帧在途结果", drained);
        }
        let _ = self.input_tx.send_timeout(EngineMsg::Shutdown, Duration::from_secs(1));
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("推理线程异常退出");
            }
        }
        self.shared.accelerator.lock().disconnect();
        info!("推理引擎已停止");
    }

    /// 丢弃在途结果直到计数归零, 返回丢弃数量
    fn drain(&self) -> usize {
        let _recv = self.recv_lock.lock();
        let mut drained = 0;
        while self.in_flight() > 0 {
            match self.output_rx.recv_timeout(DRAIN_POLL) {
                Ok(_) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drained += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let finished = self
                        .worker
                        .lock()
                        .as_ref()
                        .map_or(true, |w| w.is_finished());
                    if finished {
                        warn!("推理线程已退出, 放弃 {} 帧在途结果", self.in_flight());
                        self.in_flight.store(0, Ordering::SeqCst);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.in_flight.store(0, Ordering::SeqCst);
                    break;
                }
            }
        }
        drained
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ========== 工作线程 ==========

fn engine_loop(rx: Receiver<EngineMsg>, tx: Sender<AnnotatedFrame>, shared: Arc<EngineShared>) {
    while let Ok(msg) = rx.recv() {
        let request = match msg {
            EngineMsg::Frame(request) => request,
            EngineMsg::Shutdown => break,
        };
        let annotated = process_frame(&shared, request);
        if tx.send(annotated).is_err() {
            break;
        }
    }
    debug!("推理线程退出");
}

fn process_frame(shared: &EngineShared, request: EngineRequest) -> AnnotatedFrame {
    let EngineRequest { frame, flags } = request;
    let started = Instant::now();

    // 整帧处理期间类别配置不变
    let (classes, generation, selected) = {
        let model = shared.model.read();
        (model.classes.clone(), model.generation, model.selected.clone())
    };
    let thresholds = *shared.thresholds.read();

    let detections = match infer(shared, &frame, thresholds, &classes) {
        Ok(detections) => detections,
        Err(e) => {
            warn!("⚠️ 帧 {} 推理失败, 按无检测处理: {}", frame.seq(), e);
            Vec::new()
        }
    };
    let inference_ms = ms(started.elapsed());

    let drawn: Vec<Detection> = detections
        .iter()
        .filter(|d| selected.is_empty() || selected.contains(&d.label))
        .cloned()
        .collect();

    let (image, render_status) =
        match render::render(frame.image(), &drawn, &flags, shared.font.as_deref()) {
            Ok(image) => (Arc::new(image), RenderStatus::Rendered),
            Err(e) => {
                warn!("⚠️ 帧 {} 渲染失败, 输出原始帧: {}", frame.seq(), e);
                (frame.image().clone(), RenderStatus::Degraded(e.to_string()))
            }
        };

    AnnotatedFrame {
        frame,
        detections,
        image,
        render: render_status,
        generation,
        classes,
        inference_ms,
    }
}

fn infer(
    shared: &EngineShared,
    frame: &Frame,
    thresholds: DecodeThresholds,
    classes: &[String],
) -> Result<Vec<Detection>> {
    let (xs, geometry) = preprocess(frame.image(), shared.input_size)?;
    let raw = shared.accelerator.lock().run(xs)?;
    decode(&raw, thresholds, &geometry, classes)
}
