// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use common::{ScriptedAccelerator, ScriptedBox, ScriptedCompiler};
use sentinel_rs::alert::{AlertEngine, AlertEvent};
use sentinel_rs::config::{PipelineConfig, TrackerParams};
use sentinel_rs::detection::types::{BBox, Detection};
use sentinel_rs::detection::IouTracker;
use sentinel_rs::engine::InferenceEngine;
use sentinel_rs::input::StillImageSource;
use sentinel_rs::pipeline::{ComposedFrame, FrameSink, Pipeline, PipelineContext};
use sentinel_rs::recognition::{
    square_crop, AppearanceEmbedder, Embedder, Gallery, Recognizer, TrackRegistry, TrackState,
};
use sentinel_rs::Result;

fn portrait(seed: u8) -> RgbImage {
    RgbImage::from_fn(96, 96, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(seed),
            (y as u8).wrapping_mul(2),
            seed.wrapping_add((x ^ y) as u8),
        ])
    })
}

#[test]
fn two_enrolled_images_of_alice_match_alice() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(AppearanceEmbedder::new());
    let gallery = Arc::new(Gallery::load(dir.path(), embedder.as_ref(), None).unwrap());
    let registry = Arc::new(TrackRegistry::new());
    let recognizer =
        Recognizer::start(registry.clone(), gallery.clone(), embedder.clone(), 4, 10, 0.4).unwrap();
    let handle = recognizer.handle();

    let images = [portrait(3), portrait(9)];
    for image in &images {
        handle
            .enroll("Alice", image, None, Duration::from_secs(5))
            .unwrap();
    }

    let snapshot = gallery.snapshot();
    let alice = snapshot.entry("Alice").unwrap();
    assert_eq!(alice.embeddings.len(), 2);
    assert!(alice.images[0].ends_with("Alice/0.jpg"));
    assert!(alice.images[1].ends_with("Alice/1.jpg"));

    for image in &images {
        let e = embedder.embed(image).unwrap();
        let m = snapshot.best_match(&e).unwrap();
        assert_eq!(m.name, "Alice");
        assert!(m.distance < 1e-4, "distance {}", m.distance);
    }
    // 登记条目不残留
    assert!(registry.is_empty());

    // 重新加载: 旁注特征与内存中一致
    let reloaded = Gallery::load(dir.path(), embedder.as_ref(), None).unwrap();
    assert_eq!(reloaded.snapshot().embedding_count(), 2);
}

#[test]
fn tracker_keeps_id_and_alert_fires_once_per_appearance() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = AppearanceEmbedder::new();
    let gallery = Gallery::load(dir.path(), &embedder, None).unwrap();
    let face = portrait(5);
    gallery
        .add("Alice", &face, &embedder.embed(&face).unwrap())
        .unwrap();

    let registry = TrackRegistry::new();
    let mut tracker = IouTracker::new(TrackerParams::default());
    let mut alert = AlertEngine::new(Duration::from_secs(5));
    alert.set_search_targets(["Alice"]);

    let t0 = Instant::now();
    let mut raised = 0;
    let mut ids = Vec::new();
    for seq in 0..3u64 {
        let bbox = BBox::new(10.0 + seq as f32 * 2.0, 10.0, 40.0, 40.0, 0.9);
        let update = tracker.update(&[Detection::new(0, "person", bbox)]);
        registry.apply_tracks(&update, seq);
        ids.push(update.tracks[0].id);

        for (key, _) in registry.needs_recognition(t0, Duration::from_secs(2)) {
            let e = embedder.embed(&face).unwrap();
            assert!(registry.record_embedding(key, e, &gallery.snapshot(), 0.4));
        }
        let tracks = registry.snapshot_live();
        assert_eq!(tracks[0].state, TrackState::Identified);
        raised += alert
            .evaluate(&tracks, t0 + Duration::from_millis(40 * seq))
            .iter()
            .filter(|e| matches!(e, AlertEvent::Raised { .. }))
            .count();
    }
    assert_eq!(ids, vec![1, 1, 1]);
    assert_eq!(raised, 1);
    assert_eq!(alert.tick(t0 + Duration::from_secs(6)), Some(AlertEvent::Cleared));
}

/// 记录告警事件
#[derive(Default)]
struct RecordingSink {
    frames: usize,
    raised: Vec<(String, u32)>,
    names: Vec<String>,
}

impl FrameSink for RecordingSink {
    fn present(&mut self, frame: &ComposedFrame) -> Result<()> {
        self.frames += 1;
        for event in &frame.events {
            if let AlertEvent::Raised { name, track_id } = event {
                self.raised.push((name.clone(), *track_id));
            }
        }
        self.names
            .extend(frame.tracks.iter().map(|t| t.name.clone()));
        Ok(())
    }
}

#[test]
fn pipeline_recognizes_enrolled_target_and_alerts_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        gallery_dir: dir.path().join("gallery"),
        ..Default::default()
    };

    // 64x64 源图与 64 输入一一对应
    let accelerator = ScriptedAccelerator::new(vec![ScriptedBox {
        cx: 32.0,
        cy: 32.0,
        w: 30.0,
        h: 30.0,
        class_id: 0,
        score: 0.9,
    }]);
    let engine = InferenceEngine::start(
        Box::new(ScriptedCompiler::default()),
        Box::new(accelerator),
        &config,
    )
    .unwrap();
    let embedder = Arc::new(AppearanceEmbedder::new());
    let gallery = Arc::new(Gallery::load(&config.gallery_dir, embedder.as_ref(), None).unwrap());
    let ctx = PipelineContext::new(config, engine, gallery.clone(), embedder).unwrap();

    let scene = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
    let path = ctx.seed_target("Alice", &scene).unwrap();
    assert!(path.exists());
    // 登记使用检测框的方形裁剪
    let crop = square_crop(&scene, &BBox::new(17.0, 17.0, 30.0, 30.0, 0.9), 10).unwrap();
    assert_eq!(crop.dimensions(), (50, 50));

    let source = StillImageSource::new(scene, Duration::from_millis(10)).with_limit(60);
    let pipeline = Pipeline::start(ctx.clone(), Box::new(source)).unwrap();
    pipeline.set_search_targets(gallery.names());

    let mut sink = RecordingSink::default();
    pipeline.run_event_loop(&mut sink).unwrap();
    pipeline.shutdown();

    assert!(sink.frames > 0);
    assert!(sink.names.iter().any(|n| n == "Alice"));
    assert_eq!(sink.raised, vec![("Alice".to_string(), 1)]);
}
