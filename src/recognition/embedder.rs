// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 身份特征提取

use image::imageops::{self, FilterType};
use image::RgbImage;

use super::track::Embedding;
use crate::error::{Result, SentinelError};

/// 特征提取器 (在识别线程中调用, 不持有轨迹表锁)
pub trait Embedder: Send + Sync {
    fn embed(&self, crop: &RgbImage) -> Result<Embedding>;

    fn dim(&self) -> usize;

    /// 用于校验人脸库旁注是否由同一提取器生成
    fn name(&self) -> &str;
}

const GRID: u32 = 8;
const BINS: usize = 4;

/// 内置外观特征 (128维)
///
/// 8x8 亮度网格 (64) + 4x4x4 颜色直方图 (64), 整体 L2 归一化
#[derive(Default, Clone, Copy)]
pub struct AppearanceEmbedder;

impl AppearanceEmbedder {
    pub const DIM: usize = (GRID * GRID) as usize + BINS * BINS * BINS;

    pub fn new() -> Self {
        Self
    }
}

impl Embedder for AppearanceEmbedder {
    fn embed(&self, crop: &RgbImage) -> Result<Embedding> {
        let (w, h) = crop.dimensions();
        if w == 0 || h == 0 {
            return Err(SentinelError::Gallery("空裁剪区域".to_string()));
        }

        let mut values = Vec::with_capacity(Self::DIM);

        // 亮度网格 (去均值, 对整体明暗不敏感)
        let small = imageops::resize(crop, GRID, GRID, FilterType::Triangle);
        let luma: Vec<f32> = small
            .pixels()
            .map(|p| (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0)
            .collect();
        let mean = luma.iter().sum::<f32>() / luma.len() as f32;
        values.extend(luma.iter().map(|v| v - mean));

        // 颜色直方图
        let mut hist = [0f32; BINS * BINS * BINS];
        for p in crop.pixels() {
            let r = p[0] as usize * BINS / 256;
            let g = p[1] as usize * BINS / 256;
            let b = p[2] as usize * BINS / 256;
            hist[(r * BINS + g) * BINS + b] += 1.0;
        }
        let total = (w * h) as f32;
        values.extend(hist.iter().map(|c| c / total));

        Embedding::new(values)
    }

    fn dim(&self) -> usize {
        Self::DIM
    }

    fn name(&self) -> &str {
        "appearance-v1"
    }
}

#[cfg(feature = "ort-backend")]
pub use self::onnx::OrtEmbedder;

#[cfg(feature = "ort-backend")]
mod onnx {
    use std::path::Path;

    use image::imageops::{self, FilterType};
    use image::RgbImage;
    use ndarray::Array4;
    use ort::session::Session;
    use ort::value::Tensor;
    use parking_lot::Mutex;

    use super::Embedder;
    use crate::engine::ort_backend::{build_session, ort_error};
    use crate::error::Result;
    use crate::recognition::track::Embedding;

    /// ONNX 人脸特征模型 (ArcFace 类, 112x112 输入)
    pub struct OrtEmbedder {
        session: Mutex<Session>,
        input_size: u32,
        dim: usize,
        name: String,
    }

    impl OrtEmbedder {
        pub fn load(path: impl AsRef<Path>, dim: usize) -> Result<Self> {
            let path = path.as_ref();
            let session = build_session(path, 1)?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("onnx")
                .to_string();
            Ok(Self {
                session: Mutex::new(session),
                input_size: 112,
                dim,
                name,
            })
        }
    }

    impl Embedder for OrtEmbedder {
        fn embed(&self, crop: &RgbImage) -> Result<Embedding> {
            let size = self.input_size;
            let resized = imageops::resize(crop, size, size, FilterType::Triangle);
            let mut xs = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
            for (x, y, p) in resized.enumerate_pixels() {
                for c in 0..3 {
                    xs[[0, c, y as usize, x as usize]] = (p[c] as f32 - 127.5) / 127.5;
                }
            }

            let tensor = Tensor::from_array(xs).map_err(ort_error)?;
            let mut session = self.session.lock();
            let name = session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .ok_or_else(|| crate::error::SentinelError::accelerator("模型没有输出"))?;
            let outputs = session.run(ort::inputs![tensor]).map_err(ort_error)?;
            let values: Vec<f32> = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .map_err(ort_error)?
                .iter()
                .copied()
                .collect();
            Embedding::new(values)
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_dimension_and_norm() {
        let img = RgbImage::from_fn(30, 40, |x, y| Rgb([x as u8 * 8, y as u8 * 6, 128]));
        let e = AppearanceEmbedder::new().embed(&img).unwrap();
        assert_eq!(e.dim(), 128);
        let norm: f32 = e.as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_black_crop_is_still_valid() {
        let img = RgbImage::new(16, 16);
        assert!(AppearanceEmbedder::new().embed(&img).is_ok());
    }

    #[test]
    fn test_same_crop_zero_distance_different_crop_far() {
        let embedder = AppearanceEmbedder::new();
        let a = RgbImage::from_fn(32, 32, |x, _| Rgb([(x * 8) as u8, 20, 20]));
        let b = RgbImage::from_fn(32, 32, |_, y| Rgb([20, 20, (y * 8) as u8]));
        let ea = embedder.embed(&a).unwrap();
        let eb = embedder.embed(&b).unwrap();
        assert!(ea.cosine_distance(&embedder.embed(&a).unwrap()) < 1e-6);
        assert!(ea.cosine_distance(&eb) > 0.1);
    }
}
