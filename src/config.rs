// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线配置 - 通过JSON文件调整参数
//!
//! `PipelineConfig` 是逐帧消费的不可变快照, 重配置时整体替换

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SentinelError};

/// 检测输入尺寸 (letterbox 后的正方形边长)
pub const INF_SIZE: u32 = 640;

/// 类别提示词长度限制
const PROMPT_MIN_LEN: usize = 2;
const PROMPT_MAX_LEN: usize = 200;

/// 数字卫兵参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "数字卫兵 - 实时检测/识别/告警", long_about = None)]
pub struct Args {
    /// 视频源: 图片文件、图片目录, 或 (ffmpeg 特性) 摄像头/视频/RTSP 地址
    #[arg(short, long, default_value = "0")]
    pub source: String,

    /// 配置文件路径 (不存在时创建默认配置)
    #[arg(short, long, default_value = "sentinel.json")]
    pub config: PathBuf,

    /// 人脸库目录, 覆盖配置文件
    #[arg(long)]
    pub gallery: Option<PathBuf>,

    /// 搜索目标姓名
    #[arg(short, long)]
    pub name: Option<String>,

    /// 搜索目标参考图片, 启动时登记到人脸库
    #[arg(long)]
    pub image_file: Option<PathBuf>,

    /// 检测类别提示词, 逗号分隔 (例如 "person,dog")
    #[arg(long)]
    pub search: Option<String>,

    /// 日志级别
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// 日志目录 (为空则只输出到控制台)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// 推理后端: ort 或 passthrough
    #[arg(long, default_value = "ort")]
    pub backend: String,

    /// 置信度阈值, 覆盖配置文件
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IoU 阈值, 覆盖配置文件
    #[arg(long)]
    pub iou: Option<f32>,
}

/// 检测与识别阈值 (均在 [0,1])
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub confidence: f32, // 检测置信度
    pub iou: f32,        // NMS IoU
    pub match_threshold: f32, // 人脸库匹配的余弦距离上限
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.7,
            match_threshold: 0.4,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        check_unit("confidence", self.confidence)?;
        check_unit("iou", self.iou)?;
        check_unit("match_threshold", self.match_threshold)
    }
}

/// 逐帧可视化选项
///
/// `remove_background` 与 `blur` 互斥, 同时设置是配置错误
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisualizationFlags {
    pub segment: bool, // 分割着色
    pub boxes: bool,
    pub labels: bool,
    pub remove_background: bool,
    pub blur: bool,
    pub blur_sigma: f32,
    pub tint_alpha: f32,
}

impl Default for VisualizationFlags {
    fn default() -> Self {
        Self {
            segment: true,
            boxes: true,
            labels: true,
            remove_background: false,
            blur: false,
            blur_sigma: 0.0,
            tint_alpha: 0.25,
        }
    }
}

impl VisualizationFlags {
    pub fn validate(&self) -> Result<()> {
        if self.remove_background && self.blur {
            return Err(SentinelError::config(
                "remove_background 与 blur 不能同时启用",
            ));
        }
        if !(self.blur_sigma >= 0.0) {
            return Err(SentinelError::config(format!(
                "blur_sigma 必须 >= 0, 当前 {}",
                self.blur_sigma
            )));
        }
        check_unit("tint_alpha", self.tint_alpha)
    }
}

/// 队列深度 (容量固定, 不会增长)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueDepths {
    pub input: usize,
    pub output: usize,
    pub tracked: usize,
    pub recognition: usize,
}

impl Default for QueueDepths {
    fn default() -> Self {
        Self {
            input: 1,
            output: 1,
            tracked: 2,
            recognition: 4,
        }
    }
}

/// 入队策略: 队列满时阻塞等待或立即失败
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitPolicy {
    Block(Duration),
    Fail,
}

/// 跟踪器参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerParams {
    pub max_lost_frames: u32,      // 最大丢失帧数
    pub high_score_threshold: f32, // 高分阈值
    pub low_score_threshold: f32,  // 低分阈值 (救援用)
    pub high_iou_threshold: f32,   // 高分IOU阈值
    pub low_iou_threshold: f32,    // 低分IOU阈值
    pub kalman_process_noise: f32, // 过程噪声 q
    pub kalman_obs_noise: f32,     // 观测噪声 r
    /// 参与跟踪的类别, 为空表示全部
    pub track_classes: Vec<String>,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_lost_frames: 30,
            high_score_threshold: 0.4,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.3,
            low_iou_threshold: 0.2,
            kalman_process_noise: 0.1,
            kalman_obs_noise: 0.5,
            track_classes: Vec::new(),
        }
    }
}

/// 识别参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognitionParams {
    /// 裁剪外扩像素
    pub margin: u32,
    /// 识别请求超过该时长未完成则允许重试
    pub retry_after_ms: u64,
    /// 手动登记等待上限
    pub enroll_timeout_ms: u64,
}

impl Default for RecognitionParams {
    fn default() -> Self {
        Self {
            margin: 10,
            retry_after_ms: 2000,
            enroll_timeout_ms: 10_000,
        }
    }
}

/// 流水线配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    // === 检测参数 ===
    pub classes: Vec<String>,          // 当前激活的检测类别
    pub selected_classes: Vec<String>, // 需要绘制的类别 (为空表示全部)
    pub thresholds: Thresholds,
    pub visualization: VisualizationFlags,

    // === 队列 ===
    pub queues: QueueDepths,
    pub block_on_full: bool,
    pub submit_timeout_ms: u64,

    pub tracker: TrackerParams,
    pub recognition: RecognitionParams,

    /// 告警显示时长
    pub alert_duration_ms: u64,

    // === 路径 ===
    pub model_dir: PathBuf,
    pub model_name: String,
    pub gallery_dir: PathBuf,
    /// 为空时查找默认字体 (`assets/font/msyh.ttc` 及系统字体)
    pub font_path: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
    /// 人脸特征模型 (ort-backend), 为空时使用内置外观特征
    pub embedder_model: Option<PathBuf>,
    pub embedder_dim: usize,
    /// 外部导出命令 (例如 "python export.py"), 参数依次为类别列表与输出路径
    pub export_command: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classes: vec!["person".to_string()],
            selected_classes: Vec::new(),
            thresholds: Thresholds::default(),
            visualization: VisualizationFlags::default(),
            queues: QueueDepths::default(),
            block_on_full: true,
            submit_timeout_ms: 100,
            tracker: TrackerParams::default(),
            recognition: RecognitionParams::default(),
            alert_duration_ms: 5000,
            model_dir: PathBuf::from("models"),
            model_name: "yoloe-v8s-seg".to_string(),
            gallery_dir: PathBuf::from("face_database"),
            font_path: None,
            snapshot_dir: None,
            embedder_model: None,
            embedder_dim: 512,
            export_command: None,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析或校验失败返回配置错误
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => {
                let config: Self = serde_json::from_str(&json).map_err(|e| {
                    SentinelError::config(format!("配置文件 {} 解析失败: {}", path.display(), e))
                })?;
                config.validate()?;
                info!("✅ 配置已从 {} 加载", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("配置文件不存在, 创建默认配置 {}", path.display());
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(SentinelError::config("类别列表不能为空"));
        }
        for class in &self.classes {
            validate_prompt(class)?;
        }
        for class in &self.selected_classes {
            if !self.classes.contains(class) {
                return Err(SentinelError::config(format!("{} 不是有效类别", class)));
            }
        }
        self.thresholds.validate()?;
        self.visualization.validate()?;

        let q = &self.queues;
        if q.input == 0 || q.output == 0 || q.tracked == 0 || q.recognition == 0 {
            return Err(SentinelError::config("队列深度必须 >= 1"));
        }

        let t = &self.tracker;
        check_unit("tracker.high_score_threshold", t.high_score_threshold)?;
        check_unit("tracker.low_score_threshold", t.low_score_threshold)?;
        check_unit("tracker.high_iou_threshold", t.high_iou_threshold)?;
        check_unit("tracker.low_iou_threshold", t.low_iou_threshold)?;
        if t.low_score_threshold > t.high_score_threshold {
            return Err(SentinelError::config("低分阈值不能高于高分阈值"));
        }
        Ok(())
    }

    pub fn submit_policy(&self) -> SubmitPolicy {
        if self.block_on_full {
            SubmitPolicy::Block(Duration::from_millis(self.submit_timeout_ms))
        } else {
            SubmitPolicy::Fail
        }
    }

    pub fn alert_duration(&self) -> Duration {
        Duration::from_millis(self.alert_duration_ms)
    }

    /// 是否绘制该类别
    pub fn is_selected(&self, label: &str) -> bool {
        self.selected_classes.is_empty() || self.selected_classes.iter().any(|c| c == label)
    }

    /// 命令行参数覆盖
    pub fn apply_args(&mut self, args: &Args) -> Result<()> {
        if let Some(conf) = args.conf {
            self.thresholds.confidence = conf;
        }
        if let Some(iou) = args.iou {
            self.thresholds.iou = iou;
        }
        if let Some(gallery) = &args.gallery {
            self.gallery_dir = gallery.clone();
        }
        self.validate()
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            "当前配置: 类别 {:?} | 置信度 {:.2} | IoU {:.2} | 匹配阈值 {:.2} | 队列 {}/{}/{}/{}",
            self.classes,
            self.thresholds.confidence,
            self.thresholds.iou,
            self.thresholds.match_threshold,
            self.queues.input,
            self.queues.output,
            self.queues.tracked,
            self.queues.recognition,
        );
    }
}

/// 校验类别提示词: 去除首尾空白后长度在 2..=200
pub fn validate_prompt(prompt: &str) -> Result<String> {
    let trimmed = prompt.trim();
    let len = trimmed.chars().count();
    if len < PROMPT_MIN_LEN {
        return Err(SentinelError::config(format!(
            "提示词过短 (至少 {} 个字符): {:?}",
            PROMPT_MIN_LEN, prompt
        )));
    }
    if len > PROMPT_MAX_LEN {
        return Err(SentinelError::config(format!(
            "提示词过长 (最多 {} 个字符)",
            PROMPT_MAX_LEN
        )));
    }
    Ok(trimmed.to_string())
}

/// 解析逗号分隔的类别列表
pub fn parse_class_list(text: &str) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for part in text.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let class = validate_prompt(part)?;
        if !classes.contains(&class) {
            classes.push(class);
        }
    }
    if classes.is_empty() {
        return Err(SentinelError::config("类别列表不能为空"));
    }
    Ok(classes)
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SentinelError::config(format!(
            "{} 必须在 [0,1] 内, 当前 {}",
            name, value
        )))
    }
}
