// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统 (Detection System)
///
/// - types:   帧、检测框、分割多边形
/// - tracker: 目标追踪
pub mod tracker;
pub mod types;

pub use tracker::{IouTracker, Track, TrackUpdate};
