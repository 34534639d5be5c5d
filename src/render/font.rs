// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 标签字体

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{Result, SentinelError};

/// 默认字号 (像素)
const DEFAULT_SCALE: f32 = 20.0;

/// 未配置 `font_path` 时按顺序查找
pub const DEFAULT_FONTS: [&str; 5] = [
    "assets/font/msyh.ttc",
    "C:\\Windows\\Fonts\\msyh.ttc",
    "/System/Library/Fonts/PingFang.ttc",
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
];

/// 第一个存在的字体文件
pub fn find_font(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

pub struct LabelFont {
    font: FontArc,
    scale: PxScale,
}

impl LabelFont {
    /// 加载 TTF/OTF 字体 (支持中文字体)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let font = FontArc::try_from_vec(data).map_err(|e| {
            SentinelError::config(format!("字体加载失败 {}: {}", path.display(), e))
        })?;
        info!("✅ 字体加载成功: {}", path.display());
        Ok(Self {
            font,
            scale: PxScale::from(DEFAULT_SCALE),
        })
    }

    /// 按配置加载: 显式配置的字体必须可用; 未配置时依次尝试默认字体,
    /// 都不存在时不绘制文字
    pub fn from_config(config: &PipelineConfig) -> Result<Option<Arc<Self>>> {
        if let Some(path) = &config.font_path {
            return Ok(Some(Arc::new(Self::load(path)?)));
        }
        let candidates: Vec<PathBuf> = DEFAULT_FONTS.iter().map(PathBuf::from).collect();
        match find_font(&candidates) {
            Some(path) => match Self::load(&path) {
                Ok(font) => Ok(Some(Arc::new(font))),
                Err(e) => {
                    warn!("⚠️ 默认字体不可用 ({}), 标签文字将不绘制", e);
                    Ok(None)
                }
            },
            None => {
                warn!(
                    "⚠️ 未找到中文字体文件 (默认 {}), 标签文字将不绘制",
                    DEFAULT_FONTS[0]
                );
                Ok(None)
            }
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = PxScale::from(scale);
        self
    }

    /// 文本尺寸 (宽, 高)
    pub fn measure(&self, text: &str) -> (u32, u32) {
        text_size(self.scale, &self.font, text)
    }

    pub fn draw(&self, image: &mut RgbImage, text: &str, x: i32, y: i32, color: Rgb<u8>) {
        draw_text_mut(image, color, x, y, self.scale, &self.font, text);
    }

    /// 描边文字: 先画深色描边, 再画彩色正文
    pub fn draw_outlined(&self, image: &mut RgbImage, text: &str, x: i32, y: i32, color: Rgb<u8>) {
        let dark = Rgb([0, 0, 0]);
        for (dx, dy) in [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)] {
            self.draw(image, text, x + dx, y + dy, dark);
        }
        self.draw(image, text, x, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_font_takes_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let second = dir.path().join("b.ttf");
        let third = dir.path().join("c.ttf");
        std::fs::write(&second, b"x").unwrap();
        std::fs::write(&third, b"x").unwrap();

        let candidates = vec![dir.path().join("a.ttf"), second.clone(), third];
        assert_eq!(find_font(&candidates), Some(second));
        assert_eq!(find_font(&[dir.path().join("missing.ttf")]), None);
        // 目录不算字体文件
        assert_eq!(find_font(&[dir.path().to_path_buf()]), None);
    }

    #[test]
    fn test_configured_font_must_load() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.ttf");
        std::fs::write(&bogus, b"not a font").unwrap();
        let config = PipelineConfig {
            font_path: Some(bogus),
            ..Default::default()
        };
        assert!(matches!(
            LabelFont::from_config(&config),
            Err(SentinelError::Configuration(_))
        ));

        let missing = PipelineConfig {
            font_path: Some(dir.path().join("missing.ttf")),
            ..Default::default()
        };
        assert!(LabelFont::from_config(&missing).is_err());
    }

    #[test]
    fn test_default_font_lookup_never_fails() {
        // 无论本机是否有默认字体, 未配置时都不报错
        assert!(LabelFont::from_config(&PipelineConfig::default()).is_ok());
    }
}
