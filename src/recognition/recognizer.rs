// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 识别工作线程
//!
//! 有界识别队列 → 计算特征 (不持锁) → 匹配人脸库快照 → 锁内写回轨迹表
//! 每个请求可携带完成通道, 登记流程据此等待而不是轮询

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use image::imageops;
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::embedder::Embedder;
use super::gallery::{validate_name, Gallery};
use super::track::{Embedding, TrackKey, TrackRegistry};
use crate::detection::types::BBox;
use crate::error::{Result, SentinelError};

/// 识别请求
pub struct RecognitionJob {
    pub key: TrackKey,
    pub crop: RgbImage,
    pub completion: Option<Sender<Result<Embedding>>>,
}

enum RecognitionMsg {
    Job(RecognitionJob),
    Shutdown,
}

/// 方形裁剪: 边长 max(w,h) + 2·margin, 以框中心为中心, 裁剪到画面内
pub fn square_crop(image: &RgbImage, bbox: &BBox, margin: u32) -> Option<RgbImage> {
    let (iw, ih) = image.dimensions();
    let size = bbox.width().max(bbox.height()) + 2.0 * margin as f32;
    let (cx, cy) = bbox.center();
    let x1 = (cx - size / 2.0).round().clamp(0.0, iw as f32) as u32;
    let y1 = (cy - size / 2.0).round().clamp(0.0, ih as f32) as u32;
    let x2 = (cx + size / 2.0).round().clamp(0.0, iw as f32) as u32;
    let y2 = (cy + size / 2.0).round().clamp(0.0, ih as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// 识别句柄: 可克隆, 供消费线程与控制调用共享
#[derive(Clone)]
pub struct RecognitionHandle {
    tx: Sender<RecognitionMsg>,
    registry: Arc<TrackRegistry>,
    gallery: Arc<Gallery>,
    margin: u32,
    match_threshold: f32,
}

impl RecognitionHandle {
    /// 为实时轨迹提交识别 (非阻塞)
    ///
    /// 队列满时撤销识别标记, 由后续帧重试
    pub fn submit_live(&self, key: TrackKey, image: &RgbImage, bbox: &BBox) -> Result<()> {
        let Some(crop) = square_crop(image, bbox, self.margin) else {
            self.registry.cancel_recognition(key);
            return Ok(());
        };
        let job = RecognitionJob {
            key,
            crop,
            completion: None,
        };
        match self.tx.try_send(RecognitionMsg::Job(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.registry.cancel_recognition(key);
                Err(SentinelError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.registry.cancel_recognition(key);
                Err(SentinelError::Stopped)
            }
        }
    }

    /// 手动登记: 合成条目走同一识别队列, 等待完成信号后写入人脸库
    ///
    /// `bbox` 为空时使用整幅图像
    pub fn enroll(
        &self,
        name: &str,
        image: &RgbImage,
        bbox: Option<BBox>,
        timeout: Duration,
    ) -> Result<PathBuf> {
        validate_name(name)?;
        let deadline = Instant::now() + timeout;
        let (w, h) = image.dimensions();
        let bbox = bbox.unwrap_or_else(|| BBox::new(0.0, 0.0, w as f32, h as f32, 1.0));
        let crop = match square_crop(image, &bbox, self.margin) {
            Some(c) => c,
            None => image.clone(),
        };

        let key = self.registry.insert_enrollment(bbox, "face");
        let _guard = EnrollmentGuard {
            registry: self.registry.as_ref(),
            key,
        };

        let (done_tx, done_rx) = bounded(1);
        let job = RecognitionJob {
            key,
            crop: crop.clone(),
            completion: Some(done_tx),
        };
        self.tx
            .send_timeout(RecognitionMsg::Job(job), remaining(deadline))
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SentinelError::RecognitionTimeout(name.to_string()),
                SendTimeoutError::Disconnected(_) => SentinelError::Stopped,
            })?;

        let embedding = match done_rx.recv_timeout(remaining(deadline)) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(SentinelError::RecognitionTimeout(name.to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => return Err(SentinelError::Stopped),
        };

        let path = self.gallery.add(name, &crop, &embedding)?;
        self.registry
            .rematch(&self.gallery.snapshot(), self.match_threshold);
        Ok(path)
    }

    pub fn registry(&self) -> &Arc<TrackRegistry> {
        &self.registry
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// 登记结束 (成功、超时或出错) 时移除合成条目
struct EnrollmentGuard<'a> {
    registry: &'a TrackRegistry,
    key: TrackKey,
}

impl Drop for EnrollmentGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}

/// 识别线程
pub struct Recognizer {
    handle: RecognitionHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Recognizer {
    pub fn start(
        registry: Arc<TrackRegistry>,
        gallery: Arc<Gallery>,
        embedder: Arc<dyn Embedder>,
        queue_depth: usize,
        margin: u32,
        match_threshold: f32,
    ) -> Result<Self> {
        let (tx, rx) = bounded(queue_depth.max(1));
        let worker = {
            let registry = registry.clone();
            let gallery = gallery.clone();
            std::thread::Builder::new()
                .name("sentinel-recognition".to_string())
                .spawn(move || recognition_loop(rx, registry, gallery, embedder, match_threshold))?
        };
        info!("✅ 识别线程已启动 (队列深度 {})", queue_depth);
        Ok(Self {
            handle: RecognitionHandle {
                tx,
                registry,
                gallery,
                margin,
                match_threshold,
            },
            worker: Mutex::new(Some(worker)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> RecognitionHandle {
        self.handle.clone()
    }

    /// 发送终止消息并等待线程退出 (幂等)
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // 队列中剩余请求会先被处理
        let _ = self.handle.tx.send(RecognitionMsg::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("识别线程异常退出");
            }
        }
        info!("识别线程已停止");
    }
}

impl Drop for Recognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recognition_loop(
    rx: Receiver<RecognitionMsg>,
    registry: Arc<TrackRegistry>,
    gallery: Arc<Gallery>,
    embedder: Arc<dyn Embedder>,
    match_threshold: f32,
) {
    while let Ok(msg) = rx.recv() {
        let job = match msg {
            RecognitionMsg::Job(job) => job,
            RecognitionMsg::Shutdown => break,
        };

        let started = Instant::now();
        let result = embedder.embed(&job.crop);
        match &result {
            Ok(embedding) => {
                let snapshot = gallery.snapshot();
                if !registry.record_embedding(job.key, embedding.clone(), &snapshot, match_threshold) {
                    debug!("轨迹 {:?} 已消失, 丢弃识别结果", job.key);
                } else if let Some(t) = registry.get(job.key) {
                    debug!(
                        "识别 {:?} → {} ({:.1} ms)",
                        job.key,
                        t.name,
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                warn!("⚠️ 特征提取失败 {:?}: {}", job.key, e);
                registry.cancel_recognition(job.key);
            }
        }

        if let Some(done) = job.completion {
            let _ = done.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::embedder::AppearanceEmbedder;
    use image::Rgb;

    #[test]
    fn test_square_crop_is_centered_and_clamped() {
        let image = RgbImage::new(100, 80);
        let crop = square_crop(&image, &BBox::new(40.0, 30.0, 20.0, 10.0, 1.0), 10).unwrap();
        assert_eq!(crop.dimensions(), (40, 40));

        let edge = square_crop(&image, &BBox::new(0.0, 0.0, 20.0, 20.0, 1.0), 10).unwrap();
        assert_eq!(edge.dimensions(), (30, 30));

        assert!(square_crop(&image, &BBox::new(500.0, 500.0, 5.0, 5.0, 1.0), 0).is_none());
    }

    #[test]
    fn test_enroll_persists_and_removes_synthetic_entry() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(AppearanceEmbedder::new());
        let gallery = Arc::new(Gallery::load(dir.path(), embedder.as_ref(), None).unwrap());
        let registry = Arc::new(TrackRegistry::new());
        let recognizer =
            Recognizer::start(registry.clone(), gallery.clone(), embedder, 4, 10, 0.4).unwrap();

        let image = RgbImage::from_fn(64, 64, |x, y| Rgb([x as u8 * 4, y as u8 * 4, 90]));
        let path = recognizer
            .handle()
            .enroll("Carol", &image, None, Duration::from_secs(5))
            .unwrap();
        assert!(path.exists());
        assert!(registry.is_empty());
        assert_eq!(gallery.names(), vec!["Carol".to_string()]);

        recognizer.stop();
        recognizer.stop();
        let err = recognizer
            .handle()
            .enroll("Carol", &image, None, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, SentinelError::Stopped));
        assert!(registry.is_empty());
    }
}
