// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 告警引擎 (AlertEngine)
//!
//! 边沿触发: 搜索目标的轨迹 ID 在本帧出现而上一帧没有时告警一次
//! 每次告警重启单次定时器, 到期自动清除

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use tracing::info;

use crate::recognition::track::{TrackKey, TrackState, TrackedObject};

/// 告警通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    Raised { name: String, track_id: u32 },
    Cleared,
}

/// 当前显示的告警
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAlert {
    /// 本次触发帧中出现的目标, 最后一个为最近触发者
    pub names: Vec<String>,
    pub message: String,
    pub expires_at: Instant,
}

impl ActiveAlert {
    /// 最近触发的目标
    pub fn latest(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }
}

pub struct AlertEngine {
    duration: Duration,
    targets: HashSet<String>,
    // 上一帧可见的 轨迹ID → 姓名
    previous: BTreeMap<u32, String>,
    current: Option<ActiveAlert>,
}

impl AlertEngine {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            targets: HashSet::new(),
            previous: BTreeMap::new(),
            current: None,
        }
    }

    /// 替换搜索目标集合
    ///
    /// 已可见的目标不会因此重复告警
    pub fn set_search_targets<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = names.into_iter().map(Into::into).collect();
        self.previous.retain(|_, name| self.targets.contains(name));
        info!("🎯 搜索目标: {:?}", self.targets);
    }

    pub fn targets(&self) -> &HashSet<String> {
        &self.targets
    }

    /// 评估一帧的轨迹快照, 返回本帧产生的事件
    pub fn evaluate(&mut self, tracks: &[TrackedObject], now: Instant) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        if let Some(cleared) = self.tick(now) {
            events.push(cleared);
        }

        let visible_now: BTreeMap<u32, String> = tracks
            .iter()
            .filter(|t| t.state != TrackState::Removed)
            .filter(|t| self.targets.contains(&t.name))
            .filter_map(|t| match t.key {
                TrackKey::Live(id) => Some((id, t.name.clone())),
                TrackKey::Enrollment(_) => None,
            })
            .collect();

        let mut raised = Vec::new();
        for (&id, name) in &visible_now {
            if self.previous.get(&id) != Some(name) {
                info!("🚨 告警: {} 出现 (轨迹 #{})", name, id);
                events.push(AlertEvent::Raised {
                    name: name.clone(),
                    track_id: id,
                });
                if !raised.contains(name) {
                    raised.push(name.clone());
                }
            }
        }

        if !raised.is_empty() {
            let message = format!("发现目标: {}", raised.join(", "));
            self.current = Some(ActiveAlert {
                names: raised,
                message,
                expires_at: now + self.duration,
            });
        }
        self.previous = visible_now;
        events
    }

    /// 检查定时器, 到期时清除告警
    pub fn tick(&mut self, now: Instant) -> Option<AlertEvent> {
        match &self.current {
            Some(alert) if now >= alert.expires_at => {
                self.current = None;
                info!("告警已清除");
                Some(AlertEvent::Cleared)
            }
            _ => None,
        }
    }

    pub fn current(&self) -> Option<&ActiveAlert> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::BBox;

    fn target(id: u32, name: &str) -> TrackedObject {
        let mut t = TrackedObject::new(
            TrackKey::Live(id),
            BBox::new(0.0, 0.0, 10.0, 10.0, 0.9),
            "person",
            0,
        );
        t.name = name.to_string();
        t.state = TrackState::Identified;
        t
    }

    fn raised(events: &[AlertEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, AlertEvent::Raised { .. }))
            .count()
    }

    #[test]
    fn test_edge_triggered_and_auto_clear() {
        let mut engine = AlertEngine::new(Duration::from_secs(5));
        engine.set_search_targets(["Alice"]);
        let t0 = Instant::now();
        let alice = vec![target(7, "Alice")];

        // 第 1 帧: 出现 → 告警一次
        let events = engine.evaluate(&alice, t0);
        assert_eq!(
            events,
            vec![AlertEvent::Raised {
                name: "Alice".to_string(),
                track_id: 7
            }]
        );

        // 第 2、3 帧: 持续可见, 不再告警
        assert!(engine.evaluate(&alice, t0 + Duration::from_millis(40)).is_empty());
        assert!(engine.evaluate(&alice, t0 + Duration::from_millis(80)).is_empty());
        assert_eq!(engine.current().and_then(|a| a.latest()), Some("Alice"));

        // 5 秒后清除
        assert_eq!(
            engine.tick(t0 + Duration::from_millis(5001)),
            Some(AlertEvent::Cleared)
        );
        assert!(engine.current().is_none());
    }

    #[test]
    fn test_reappearance_retriggers_once() {
        let mut engine = AlertEngine::new(Duration::from_secs(5));
        engine.set_search_targets(["Alice"]);
        let t0 = Instant::now();
        let alice = vec![target(3, "Alice")];

        assert_eq!(raised(&engine.evaluate(&alice, t0)), 1);
        assert_eq!(raised(&engine.evaluate(&[], t0 + Duration::from_secs(1))), 0);
        assert_eq!(raised(&engine.evaluate(&alice, t0 + Duration::from_secs(2))), 1);
        assert_eq!(raised(&engine.evaluate(&alice, t0 + Duration::from_secs(3))), 0);

        // 重新触发后定时器重启
        assert!(engine.tick(t0 + Duration::from_millis(6500)).is_none());
        assert!(engine.tick(t0 + Duration::from_secs(7)).is_some());
    }

    #[test]
    fn test_non_targets_and_unknown_ignored() {
        let mut engine = AlertEngine::new(Duration::from_secs(5));
        engine.set_search_targets(["Alice"]);
        let tracks = vec![target(1, "Bob"), target(2, "Unknown")];
        assert!(engine.evaluate(&tracks, Instant::now()).is_empty());
        assert!(engine.current().is_none());
    }

    #[test]
    fn test_simultaneous_targets_all_reported() {
        let mut engine = AlertEngine::new(Duration::from_secs(5));
        engine.set_search_targets(["Alice", "Bob"]);
        let events = engine.evaluate(&[target(1, "Alice"), target(2, "Bob")], Instant::now());
        assert_eq!(raised(&events), 2);
        let alert = engine.current().unwrap();
        assert_eq!(alert.names, vec!["Alice".to_string(), "Bob".to_string()]);
        assert_eq!(alert.latest(), Some("Bob"));
    }

    #[test]
    fn test_name_resolved_later_raises_on_that_frame() {
        let mut engine = AlertEngine::new(Duration::from_secs(5));
        engine.set_search_targets(["Alice"]);
        let t0 = Instant::now();
        assert!(engine.evaluate(&[target(4, "Unknown")], t0).is_empty());
        assert_eq!(raised(&engine.evaluate(&[target(4, "Alice")], t0)), 1);
    }
}
