// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 图片序列源: 按文件名顺序回放目录中的录制帧

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::RgbImage;
use tracing::{info, warn};

use super::{is_image_file, FrameSource};
use crate::error::{Result, SentinelError};

pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    interval: Duration,
    looping: bool,
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_image_file(p))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(SentinelError::Source(format!(
                "目录中没有图片: {}",
                dir.display()
            )));
        }
        info!("🎞️ 图片序列源: {} ({} 帧)", dir.display(), files.len());
        Ok(Self {
            dir,
            files,
            next: 0,
            interval,
            looping: false,
        })
    }

    /// 播放结束后从头循环
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        // 跳过损坏的文件, 连续失败一整轮则报错
        for _ in 0..self.files.len() {
            if self.next >= self.files.len() {
                if !self.looping {
                    return Ok(None);
                }
                self.next = 0;
            }
            let path = &self.files[self.next];
            self.next += 1;
            match image::open(path) {
                Ok(img) => return Ok(Some(img.to_rgb8())),
                Err(e) => warn!("⚠️ 跳过无法解码的帧 {}: {}", path.display(), e),
            }
        }
        if self.next >= self.files.len() && !self.looping {
            return Ok(None);
        }
        Err(SentinelError::Source(format!(
            "序列中没有可解码的图片: {}",
            self.dir.display()
        )))
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn describe(&self) -> String {
        format!("图片序列 {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_plays_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        for (name, v) in [("002.png", 20u8), ("001.png", 10), ("003.png", 30)] {
            RgbImage::from_pixel(4, 4, Rgb([v, v, v]))
                .save(dir.path().join(name))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), Duration::from_millis(1)).unwrap();
        assert_eq!(source.len(), 3);
        let values: Vec<u8> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|img| img.get_pixel(0, 0)[0])
            .collect();
        assert_eq!(values, vec![10, 20, 30]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequenceSource::open(dir.path(), Duration::from_millis(1)).is_err());
    }
}
