// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 轨迹表 (Track Registry)
//!
//! 唯一被多线程修改的共享结构: 单把互斥锁, 只在访问 map 时持有,
//! 读者 (合成、告警) 在锁内取快照后再迭代

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::gallery::GallerySnapshot;
use crate::detection::tracker::TrackUpdate;
use crate::detection::types::{BBox, Keypoint};
use crate::error::{Result, SentinelError};

pub const UNKNOWN_NAME: &str = "Unknown";

/// 轨迹键: 实时轨迹与手动登记条目使用互不相交的命名空间
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKey {
    Live(u32),
    Enrollment(u64),
}

impl TrackKey {
    pub fn is_live(&self) -> bool {
        matches!(self, TrackKey::Live(_))
    }
}

/// 轨迹状态
///
/// `New → Tracked → Recognizing → Identified | Unknown → Stale → Removed`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    New,
    Tracked,
    Recognizing,
    Identified,
    Unknown,
    Stale,
    Removed,
}

/// 身份特征向量 (L2 归一化, 永不为零向量)
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding(Arc<[f32]>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return Err(SentinelError::Gallery("特征向量非法".to_string()));
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(SentinelError::Gallery("特征向量为零向量".to_string()));
        }
        Ok(Self(values.into_iter().map(|v| v / norm).collect()))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// 余弦距离 (0 表示完全相同); 维度不同视为最远
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        if self.dim() != other.dim() {
            return 2.0;
        }
        let dot: f32 = self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum();
        (1.0 - dot).max(0.0)
    }
}

/// 被跟踪对象
#[derive(Clone, Debug)]
pub struct TrackedObject {
    pub key: TrackKey,
    pub bbox: BBox,
    pub label: String,
    pub keypoints: Vec<Keypoint>,
    pub embedding: Option<Embedding>,
    pub name: String,
    /// 与人脸库最近邻的距离
    pub distance: Option<f32>,
    pub state: TrackState,
    pub last_seen: u64,
    pub frames_lost: u32,
    requested_at: Option<Instant>,
}

impl TrackedObject {
    pub fn new(key: TrackKey, bbox: BBox, label: impl Into<String>, last_seen: u64) -> Self {
        Self {
            key,
            bbox,
            label: label.into(),
            keypoints: Vec::new(),
            embedding: None,
            name: UNKNOWN_NAME.to_string(),
            distance: None,
            state: TrackState::New,
            last_seen,
            frames_lost: 0,
            requested_at: None,
        }
    }

    pub fn track_id(&self) -> Option<u32> {
        match self.key {
            TrackKey::Live(id) => Some(id),
            TrackKey::Enrollment(_) => None,
        }
    }

    pub fn is_identified(&self) -> bool {
        self.state == TrackState::Identified
            || (self.state == TrackState::Stale && self.name != UNKNOWN_NAME)
    }

    /// 重新可见时的状态
    fn visible_state(&self) -> TrackState {
        match (&self.embedding, self.requested_at) {
            (Some(_), _) if self.name != UNKNOWN_NAME => TrackState::Identified,
            (Some(_), _) => TrackState::Unknown,
            (None, Some(_)) => TrackState::Recognizing,
            (None, None) => TrackState::Tracked,
        }
    }

    fn assign_identity(&mut self, gallery: &GallerySnapshot, threshold: f32) {
        let Some(embedding) = &self.embedding else {
            return;
        };
        match gallery.best_match(embedding) {
            Some(m) if m.distance < threshold => {
                self.name = m.name;
                self.distance = Some(m.distance);
            }
            Some(m) => {
                self.name = UNKNOWN_NAME.to_string();
                self.distance = Some(m.distance);
            }
            None => {
                self.name = UNKNOWN_NAME.to_string();
                self.distance = None;
            }
        }
        if self.frames_lost == 0 {
            self.state = self.visible_state();
        }
    }
}

/// 共享轨迹表
#[derive(Default)]
pub struct TrackRegistry {
    inner: Mutex<HashMap<TrackKey, TrackedObject>>,
    next_enrollment: AtomicU64,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并一帧跟踪结果, 返回被删除的轨迹ID
    pub fn apply_tracks(&self, update: &TrackUpdate, seq: u64) -> Vec<u32> {
        let mut map = self.inner.lock();
        for track in &update.tracks {
            let key = TrackKey::Live(track.id);
            let entry = map
                .entry(key)
                .or_insert_with(|| TrackedObject::new(key, track.bbox, track.label.clone(), seq));
            entry.bbox = track.bbox;
            entry.keypoints = track.keypoints.clone();
            entry.frames_lost = track.frames_lost;
            if track.frames_lost == 0 {
                entry.last_seen = seq;
                entry.state = if track.age <= 1 {
                    TrackState::New
                } else {
                    entry.visible_state()
                };
            } else {
                entry.state = TrackState::Stale;
            }
        }
        for id in &update.removed {
            if let Some(mut t) = map.remove(&TrackKey::Live(*id)) {
                t.state = TrackState::Removed;
                debug!("轨迹 #{} 已删除 (最后出现于第 {} 帧)", id, t.last_seen);
            }
        }
        update.removed.clone()
    }

    /// 实时轨迹快照 (按ID排序, 不含登记条目)
    pub fn snapshot_live(&self) -> Vec<TrackedObject> {
        let map = self.inner.lock();
        let mut tracks: Vec<TrackedObject> =
            map.values().filter(|t| t.key.is_live()).cloned().collect();
        drop(map);
        tracks.sort_by_key(|t| t.key);
        tracks
    }

    /// 选出需要识别的轨迹并标记为识别中
    ///
    /// 条件: 当前帧可见、尚无特征; 请求超过 `retry_after` 未完成的允许重试
    pub fn needs_recognition(&self, now: Instant, retry_after: Duration) -> Vec<(TrackKey, BBox)> {
        let mut map = self.inner.lock();
        let mut out = Vec::new();
        for t in map.values_mut() {
            if !t.key.is_live() || t.embedding.is_some() || t.frames_lost > 0 {
                continue;
            }
            let due = match t.requested_at {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= retry_after,
            };
            if due {
                if t.requested_at.is_some() {
                    debug!("轨迹 {:?} 识别超时, 重新提交", t.key);
                }
                t.requested_at = Some(now);
                t.state = TrackState::Recognizing;
                out.push((t.key, t.bbox));
            }
        }
        out.sort_by_key(|(k, _)| *k);
        out
    }

    /// 识别请求未能入队时撤销标记
    pub fn cancel_recognition(&self, key: TrackKey) {
        let mut map = self.inner.lock();
        if let Some(t) = map.get_mut(&key) {
            t.requested_at = None;
            if t.frames_lost == 0 {
                t.state = t.visible_state();
            }
        }
    }

    /// 写回特征并匹配身份; 轨迹已消失时返回 false
    pub fn record_embedding(
        &self,
        key: TrackKey,
        embedding: Embedding,
        gallery: &GallerySnapshot,
        threshold: f32,
    ) -> bool {
        let mut map = self.inner.lock();
        match map.get_mut(&key) {
            Some(t) => {
                t.embedding = Some(embedding);
                t.assign_identity(gallery, threshold);
                true
            }
            None => false,
        }
    }

    /// 人脸库更新后重新匹配所有实时轨迹
    pub fn rematch(&self, gallery: &GallerySnapshot, threshold: f32) {
        let mut map = self.inner.lock();
        for t in map.values_mut().filter(|t| t.key.is_live()) {
            t.assign_identity(gallery, threshold);
        }
    }

    /// 插入登记条目 (与实时轨迹同类型, 独立命名空间)
    pub fn insert_enrollment(&self, bbox: BBox, label: &str) -> TrackKey {
        let key = TrackKey::Enrollment(self.next_enrollment.fetch_add(1, Ordering::SeqCst));
        let mut entry = TrackedObject::new(key, bbox, label, 0);
        entry.state = TrackState::Recognizing;
        self.inner.lock().insert(key, entry);
        key
    }

    pub fn remove(&self, key: TrackKey) -> Option<TrackedObject> {
        self.inner.lock().remove(&key)
    }

    pub fn get(&self, key: TrackKey) -> Option<TrackedObject> {
        self.inner.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::tracker::Track;

    fn track(id: u32, frames_lost: u32, age: u32) -> Track {
        Track {
            id,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0, 0.9),
            class_id: 0,
            label: "face".to_string(),
            keypoints: Vec::new(),
            frames_lost,
            age,
        }
    }

    fn update(tracks: Vec<Track>, removed: Vec<u32>) -> TrackUpdate {
        TrackUpdate { tracks, removed }
    }

    #[test]
    fn test_embedding_rejects_zero_vector() {
        assert!(Embedding::new(vec![0.0; 4]).is_err());
        let e = Embedding::new(vec![3.0, 4.0]).unwrap();
        assert!((e.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!(e.cosine_distance(&e) < 1e-6);
    }

    #[test]
    fn test_state_machine() {
        let reg = TrackRegistry::new();
        reg.apply_tracks(&update(vec![track(1, 0, 1)], vec![]), 1);
        assert_eq!(reg.get(TrackKey::Live(1)).unwrap().state, TrackState::New);

        reg.apply_tracks(&update(vec![track(1, 0, 2)], vec![]), 2);
        assert_eq!(reg.get(TrackKey::Live(1)).unwrap().state, TrackState::Tracked);

        let now = Instant::now();
        let pending = reg.needs_recognition(now, Duration::from_secs(2));
        assert_eq!(pending.len(), 1);
        assert_eq!(reg.get(TrackKey::Live(1)).unwrap().state, TrackState::Recognizing);
        // 未超时不重复提交
        assert!(reg.needs_recognition(now, Duration::from_secs(2)).is_empty());
        // 超时后允许重试
        let later = now + Duration::from_secs(3);
        assert_eq!(reg.needs_recognition(later, Duration::from_secs(2)).len(), 1);

        let e = Embedding::new(vec![1.0, 0.0]).unwrap();
        assert!(reg.record_embedding(TrackKey::Live(1), e, &GallerySnapshot::default(), 0.4));
        let t = reg.get(TrackKey::Live(1)).unwrap();
        assert_eq!(t.state, TrackState::Unknown);
        assert_eq!(t.name, UNKNOWN_NAME);

        reg.apply_tracks(&update(vec![track(1, 1, 3)], vec![]), 3);
        assert_eq!(reg.get(TrackKey::Live(1)).unwrap().state, TrackState::Stale);

        let removed = reg.apply_tracks(&update(vec![], vec![1]), 4);
        assert_eq!(removed, vec![1]);
        assert!(reg.get(TrackKey::Live(1)).is_none());
    }

    #[test]
    fn test_enrollment_entries_are_not_live() {
        let reg = TrackRegistry::new();
        reg.apply_tracks(&update(vec![track(0, 0, 1)], vec![]), 1);
        let key = reg.insert_enrollment(BBox::new(0.0, 0.0, 5.0, 5.0, 1.0), "face");
        assert!(matches!(key, TrackKey::Enrollment(_)));
        assert_eq!(reg.len(), 2);

        let live = reg.snapshot_live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key, TrackKey::Live(0));
        assert!(reg.needs_recognition(Instant::now(), Duration::ZERO).iter().all(|(k, _)| k.is_live()));

        reg.remove(key);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_record_embedding_for_vanished_track() {
        let reg = TrackRegistry::new();
        let e = Embedding::new(vec![1.0]).unwrap();
        assert!(!reg.record_embedding(TrackKey::Live(9), e, &GallerySnapshot::default(), 0.4));
    }
}
