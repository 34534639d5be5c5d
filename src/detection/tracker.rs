// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 多目标跟踪
//!
//! 卡尔曼平滑 + IoU 贪心匹配, 高低分检测框两轮关联:
//! 1. 高分框优先匹配所有轨迹
//! 2. 低分框救援未匹配的轨迹
//! 3. 其余未匹配的检测 (含低分框) 新建轨迹 (ID 单调递增, 不复用)
//! 4. 连续丢失超过 `max_lost_frames` 的轨迹删除

use super::types::{BBox, Detection, Keypoint};
use crate::config::TrackerParams;

// ========== 卡尔曼滤波器 ==========

/// 简化卡尔曼滤波器 (协方差取对角阵)
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh]
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: [f32; 8],
    p: [f32; 8],
    q: f32,
    r: f32,
    velocity_decay: f32,
    stationary_threshold: f32,
    stationary_count: u32,
}

impl KalmanBoxFilter {
    /// - `q`: 过程噪声 (越小越平滑)
    /// - `r`: 观测噪声 (越大越平滑)
    pub fn new(bbox: &BBox, q: f32, r: f32) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            state: [cx, cy, bbox.width(), bbox.height(), 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q,
            r,
            velocity_decay: 0.95,
            stationary_threshold: 2.0,
            stationary_count: 0,
        }
    }

    /// 预测下一帧 (匀速模型 + 速度衰减)
    pub fn predict(&mut self) {
        let speed = self.state[4].hypot(self.state[5]);
        let is_stationary = speed < self.stationary_threshold;

        let (pos_decay, size_decay) = if is_stationary {
            self.stationary_count += 1;
            // 连续静止3帧后大幅衰减
            let d = if self.stationary_count > 3 {
                0.7
            } else {
                self.velocity_decay
            };
            (d, d)
        } else {
            self.stationary_count = 0;
            (self.velocity_decay, 0.98)
        };
        self.state[4] *= pos_decay;
        self.state[5] *= pos_decay;
        self.state[6] *= size_decay;
        self.state[7] *= size_decay;

        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }

        let q_factor = if is_stationary { 0.5 } else { 1.0 };
        for p in self.p.iter_mut() {
            *p += self.q * q_factor;
        }
    }

    /// 融合观测值, 按残差自适应调整观测噪声
    pub fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let y = [
            cx - self.state[0],
            cy - self.state[1],
            bbox.width() - self.state[2],
            bbox.height() - self.state[3],
        ];

        let residual = y[0].hypot(y[1]);
        let adaptive_r = if residual < self.stationary_threshold {
            self.r * 0.3
        } else if residual < 10.0 {
            self.r
        } else {
            // 大幅跳变: 更信任预测
            self.r * 3.0
        };

        let mut k = [0.0f32; 8];
        for i in 0..8 {
            let r = if i < 4 { adaptive_r } else { adaptive_r * 10.0 };
            k[i] = self.p[i] / (self.p[i] + r);
        }

        let velocity_gain = if residual < self.stationary_threshold {
            0.3
        } else {
            1.0
        };
        for i in 0..4 {
            self.state[i] += k[i] * y[i];
            self.state[i + 4] += k[i + 4] * y[i] * velocity_gain;
        }

        for i in 0..8 {
            self.p[i] *= 1.0 - k[i];
        }

        if residual >= self.stationary_threshold {
            self.stationary_count = 0;
        }
    }

    pub fn state_bbox(&self, confidence: f32) -> BBox {
        Self::to_bbox(
            self.state[0],
            self.state[1],
            self.state[2],
            self.state[3],
            confidence,
        )
    }

    /// 预测的边界框 (用于匹配)
    pub fn predicted_bbox(&self) -> BBox {
        Self::to_bbox(
            self.state[0] + self.state[4],
            self.state[1] + self.state[5],
            self.state[2] + self.state[6],
            self.state[3] + self.state[7],
            1.0,
        )
    }

    fn to_bbox(cx: f32, cy: f32, w: f32, h: f32, confidence: f32) -> BBox {
        let w = w.max(1.0);
        let h = h.max(1.0);
        BBox::new(cx - w / 2.0, cy - h / 2.0, w, h, confidence)
    }
}

// ========== 跟踪结果 ==========

/// 单条轨迹的快照
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u32,
    pub bbox: BBox,
    pub class_id: usize,
    pub label: String,
    pub keypoints: Vec<Keypoint>,
    /// 连续丢失帧数, 大于0即为 Stale
    pub frames_lost: u32,
    /// 总共被跟踪的帧数
    pub age: u32,
}

/// 一帧的跟踪输出
#[derive(Clone, Debug, Default)]
pub struct TrackUpdate {
    pub tracks: Vec<Track>,
    /// 本帧被删除的轨迹ID
    pub removed: Vec<u32>,
}

struct TrackSlot {
    track: Track,
    kalman: KalmanBoxFilter,
}

impl TrackSlot {
    fn new(id: u32, det: &Detection, params: &TrackerParams) -> Self {
        let kalman = KalmanBoxFilter::new(
            &det.bbox,
            params.kalman_process_noise,
            params.kalman_obs_noise,
        );
        Self {
            track: Track {
                id,
                bbox: kalman.state_bbox(det.confidence()),
                class_id: det.class_id,
                label: det.label.clone(),
                keypoints: det.keypoints.clone(),
                frames_lost: 0,
                age: 1,
            },
            kalman,
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.track.bbox = self.kalman.state_bbox(self.track.bbox.confidence());
    }

    fn update(&mut self, det: &Detection) {
        self.kalman.update(&det.bbox);
        self.track.bbox = self.kalman.state_bbox(det.confidence());
        self.track.keypoints = det.keypoints.clone();
        self.track.frames_lost = 0;
        self.track.age += 1;
    }
}

// ========== 跟踪器 ==========

/// IoU 跟踪器
pub struct IouTracker {
    slots: Vec<TrackSlot>,
    next_id: u32,
    params: TrackerParams,
}

impl IouTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            slots: Vec::new(),
            next_id: 1,
            params,
        }
    }

    /// 更新跟踪 (一帧一次)
    pub fn update(&mut self, detections: &[Detection]) -> TrackUpdate {
        for slot in &mut self.slots {
            slot.predict();
        }

        let params = &self.params;
        let dets: Vec<&Detection> = detections
            .iter()
            .filter(|d| params.track_classes.is_empty() || params.track_classes.contains(&d.label))
            .collect();

        let mut high = Vec::new();
        let mut low = Vec::new();
        for (idx, det) in dets.iter().enumerate() {
            if det.confidence() >= params.high_score_threshold {
                high.push(idx);
            } else if det.confidence() >= params.low_score_threshold {
                low.push(idx);
            }
        }

        let mut matched_det = vec![false; dets.len()];
        let mut matched_track = vec![false; self.slots.len()];

        // 第一轮: 高分检测 + 所有轨迹
        let all_tracks: Vec<usize> = (0..self.slots.len()).collect();
        let assignments =
            self.match_detections(&dets, &high, &all_tracks, params.high_iou_threshold);
        for (d, t) in assignments {
            matched_det[d] = true;
            matched_track[t] = true;
            self.slots[t].update(dets[d]);
        }

        // 第二轮: 低分检测 + 未匹配轨迹 (救援)
        let unmatched: Vec<usize> = (0..self.slots.len())
            .filter(|&t| !matched_track[t])
            .collect();
        let assignments =
            self.match_detections(&dets, &low, &unmatched, self.params.low_iou_threshold);
        for (d, t) in assignments {
            matched_det[d] = true;
            matched_track[t] = true;
            self.slots[t].update(dets[d]);
        }

        for (t, matched) in matched_track.iter().enumerate() {
            if !matched {
                self.slots[t].track.frames_lost += 1;
            }
        }

        // 所有未匹配的检测 → 新建轨迹 (高分先分配ID)
        let mut spawn: Vec<usize> = (0..dets.len()).filter(|&d| !matched_det[d]).collect();
        spawn.sort_by(|&a, &b| dets[b].confidence().total_cmp(&dets[a].confidence()));
        for d in spawn {
            let slot = TrackSlot::new(self.next_id, dets[d], &self.params);
            self.slots.push(slot);
            self.next_id += 1;
        }

        let max_lost = self.params.max_lost_frames;
        let mut removed = Vec::new();
        self.slots.retain(|s| {
            let keep = s.track.frames_lost <= max_lost;
            if !keep {
                removed.push(s.track.id);
            }
            keep
        });

        TrackUpdate {
            tracks: self.slots.iter().map(|s| s.track.clone()).collect(),
            removed,
        }
    }

    /// IoU 贪心匹配, 返回 (检测下标, 轨迹下标)
    fn match_detections(
        &self,
        dets: &[&Detection],
        det_indices: &[usize],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        if det_indices.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for &d in det_indices {
            for &t in track_indices {
                let iou = dets[d].bbox.iou(&self.slots[t].kalman.predicted_bbox());
                if iou >= iou_threshold && iou > 0.0 {
                    candidates.push((1.0 - iou, d, t));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_det = vec![false; dets.len()];
        let mut used_track = vec![false; self.slots.len()];
        let mut assignments = Vec::new();
        for (_, d, t) in candidates {
            if !used_det[d] && !used_track[t] {
                used_det[d] = true;
                used_track[t] = true;
                assignments.push((d, t));
            }
        }
        assignments
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }

    pub fn track_count(&self) -> usize {
        self.slots.len()
    }

    /// 获取跟踪统计信息
    pub fn stats(&self) -> String {
        format!(
            "跟踪: {} 个 | 总ID: {}",
            self.slots.len(),
            self.next_id - 1
        )
    }
}

/// 根据ID生成不同颜色 (黄金角度采样)
pub fn id_to_color(id: u32) -> [u8; 3] {
    let hue = (id as f32 * 137.508) % 360.0;
    hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    [
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ]
}
