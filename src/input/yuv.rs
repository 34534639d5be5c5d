// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! YUV420P → RGB 转换 (BT.601, 定点系数 ×128)

use image::RgbImage;

use crate::error::{Result, SentinelError};

/// 平面 YUV420P 数据 (可带行步长)
pub struct Yuv420Planes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
    pub width: u32,
    pub height: u32,
}

impl Yuv420Planes<'_> {
    fn check(&self) -> Result<()> {
        let (w, h) = (self.width as usize, self.height as usize);
        let uv_rows = h.div_ceil(2);
        if w == 0 || h == 0 {
            return Err(SentinelError::Source(format!("非法分辨率 {}x{}", w, h)));
        }
        if self.y_stride < w || self.uv_stride < w.div_ceil(2) {
            return Err(SentinelError::Source(format!(
                "步长异常 y_stride={} uv_stride={}",
                self.y_stride, self.uv_stride
            )));
        }
        if self.y.len() < self.y_stride * (h - 1) + w
            || self.u.len() < self.uv_stride * (uv_rows - 1) + w.div_ceil(2)
            || self.v.len() < self.uv_stride * (uv_rows - 1) + w.div_ceil(2)
        {
            return Err(SentinelError::Source("YUV 平面数据不完整".to_string()));
        }
        Ok(())
    }
}

/// 标量转换
pub fn yuv420p_to_rgb(planes: &Yuv420Planes) -> Result<RgbImage> {
    planes.check()?;
    let (w, h) = (planes.width as usize, planes.height as usize);
    let mut buffer = vec![0u8; w * h * 3];

    let mut out_idx = 0;
    for row in 0..h {
        let y_row = row * planes.y_stride;
        let uv_row = (row >> 1) * planes.uv_stride;
        for x in 0..w {
            let y_val = planes.y[y_row + x] as i32;
            let u_val = planes.u[uv_row + (x >> 1)] as i32 - 128;
            let v_val = planes.v[uv_row + (x >> 1)] as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }

    RgbImage::from_raw(planes.width, planes.height, buffer)
        .ok_or_else(|| SentinelError::Source("RGB 缓冲区尺寸错误".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_neutral_chroma_is_gray() {
        let y = vec![100u8; 4 * 2];
        let uv = vec![128u8; 2];
        let planes = Yuv420Planes {
            y: &y,
            u: &uv,
            v: &uv,
            y_stride: 4,
            uv_stride: 2,
            width: 4,
            height: 2,
        };
        let rgb = yuv420p_to_rgb(&planes).unwrap();
        assert!(rgb.pixels().all(|p| *p == Rgb([100, 100, 100])));
    }

    #[test]
    fn test_stride_padding_is_skipped_and_red_decodes() {
        // 每行 2 像素 + 2 字节填充
        let y = vec![76, 76, 0, 0, 76, 76, 0, 0];
        let u = vec![84, 0];
        let v = vec![255, 0];
        let planes = Yuv420Planes {
            y: &y,
            u: &u,
            v: &v,
            y_stride: 4,
            uv_stride: 2,
            width: 2,
            height: 2,
        };
        let rgb = yuv420p_to_rgb(&planes).unwrap();
        let p = rgb.get_pixel(1, 1);
        assert!(p[0] > 240 && p[1] < 10 && p[2] < 10, "{:?}", p);
    }

    #[test]
    fn test_truncated_planes_rejected() {
        let y = vec![0u8; 3];
        let uv = vec![128u8; 1];
        let planes = Yuv420Planes {
            y: &y,
            u: &uv,
            v: &uv,
            y_stride: 2,
            uv_stride: 1,
            width: 2,
            height: 2,
        };
        assert!(yuv420p_to_rgb(&planes).is_err());
    }
}
