// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 静态图片源: 以固定帧率重复同一幅图像 (无摄像头时的兜底输入)

use std::path::Path;
use std::time::Duration;

use image::RgbImage;
use tracing::info;

use super::FrameSource;
use crate::error::Result;

pub struct StillImageSource {
    image: RgbImage,
    interval: Duration,
    label: String,
    // 为空表示无限重复
    remaining: Option<u64>,
}

impl StillImageSource {
    pub fn new(image: RgbImage, interval: Duration) -> Self {
        let (w, h) = image.dimensions();
        Self {
            image,
            interval,
            label: format!("静态图像 {}x{}", w, h),
            remaining: None,
        }
    }

    pub fn open(path: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)?.to_rgb8();
        info!(
            "🖼️ 静态图片源: {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        let mut source = Self::new(image, interval);
        source.label = format!("图片 {}", path.display());
        Ok(source)
    }

    /// 只产生 `n` 帧后结束
    pub fn with_limit(mut self, n: u64) -> Self {
        self.remaining = Some(n);
        self
    }
}

impl FrameSource for StillImageSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        match &mut self.remaining {
            Some(0) => return Ok(None),
            Some(n) => *n -= 1,
            None => {}
        }
        Ok(Some(self.image.clone()))
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
