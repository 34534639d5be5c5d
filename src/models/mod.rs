// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 模型前后处理
///
/// ## 核心流程
/// ```text
/// 原始帧 → preprocess (letterbox) → NCHW 张量
///          ↓
///     加速器 Accelerator::run
///          ↓
///     RawOutput → decode → Vec<Detection>
/// ```
///
/// 网络本身由加速器执行, 这里只负责张量与检测结果之间的转换
pub mod yoloe; // YOLOE 开放词表分割模型

pub use yoloe::{decode, preprocess, DecodeThresholds, Letterbox, RawOutput};
