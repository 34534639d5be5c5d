#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod alert; // 边沿触发告警
pub mod config; // 流水线配置参数
pub mod detection; // 检测数据结构与多目标跟踪
pub mod engine; // 推理引擎 (有界队列 + 热重配置)
pub mod error; // 错误分类
pub mod input; // 视频输入系统
pub mod logging; // 日志初始化
pub mod models; // 模型前后处理
pub mod pipeline; // 多阶段流水线编排
pub mod recognition; // 身份识别: 轨迹表、特征、人脸库
pub mod render; // 合成渲染

pub use crate::config::{Args, PipelineConfig, SubmitPolicy, VisualizationFlags};
pub use crate::detection::types::{AnnotatedFrame, BBox, Detection, Frame, Polygon};
pub use crate::engine::InferenceEngine;
pub use crate::error::{Result, SentinelError};

/// 非极大值抑制 (类别无关)
///
/// 按置信度降序排序后贪心保留, 与已保留框 IoU 超过阈值的候选被丢弃
pub fn non_max_suppression<T>(xs: &mut Vec<T>, iou_threshold: f32, bbox: impl Fn(&T) -> &BBox) {
    xs.sort_by(|b1, b2| bbox(b2).confidence().total_cmp(&bbox(b1).confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = bbox(&xs[prev_index]).iou(bbox(&xs[index]));
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nms_keeps_highest_score() {
        let mut xs = vec![
            BBox::new(0.0, 0.0, 100.0, 100.0, 0.6),
            BBox::new(5.0, 5.0, 100.0, 100.0, 0.9),
            BBox::new(300.0, 300.0, 50.0, 50.0, 0.4),
        ];
        non_max_suppression(&mut xs, 0.5, |b| b);
        assert_eq!(xs.len(), 2);
        assert!((xs[0].confidence() - 0.9).abs() < 1e-6);
        assert!((xs[1].confidence() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_time_string_uses_delimiter() {
        let s = gen_time_string("-");
        assert_eq!(s.matches('-').count(), 6);
    }
}
