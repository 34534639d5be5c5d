// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 合成渲染 (Compositor)
//!
//! 背景模式互斥: normal / removeBackground / blur
//! 绘制顺序: 背景 → 分割区域 (可选着色) → 检测框 → 标签

pub mod font;

use std::collections::HashSet;

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_polygon_mut};
use imageproc::rect::Rect;

use crate::config::VisualizationFlags;
use crate::detection::tracker::id_to_color;
use crate::detection::types::{BBox, Detection};
use crate::error::{Result, SentinelError};
use crate::recognition::track::{TrackKey, TrackedObject};

pub use font::LabelFont;

/// 类别调色板 (按类别序号循环)
pub const COLOR_WHEEL: [[u8; 3]; 10] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
    [128, 0, 128],
    [255, 165, 0],
    [0, 128, 128],
    [128, 128, 0],
];

const BOX_THICKNESS: i32 = 2;
const TARGET_BOX_THICKNESS: i32 = 3;
const ALERT_BANNER_HEIGHT: u32 = 40;

pub fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(COLOR_WHEEL[class_id % COLOR_WHEEL.len()])
}

/// 渲染一帧
///
/// 无检测结果时 normal 模式输出与输入逐像素相同
pub fn render(
    frame: &RgbImage,
    detections: &[Detection],
    flags: &VisualizationFlags,
    font: Option<&LabelFont>,
) -> Result<RgbImage> {
    flags.validate()?;
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return Err(SentinelError::Render("空图像".to_string()));
    }

    // 1. 选择背景
    let mut result = if flags.remove_background {
        RgbImage::new(w, h)
    } else if flags.blur && flags.blur_sigma > 0.0 {
        imageproc::filter::gaussian_blur_f32(frame, flags.blur_sigma)
    } else {
        frame.clone()
    };

    // 2. 并集掩码 + 着色层 (只含多边形颜色)
    let mut mask_all = GrayImage::new(w, h);
    let mut overlay = RgbImage::new(w, h);
    let mut any_mask = false;
    for det in detections {
        let Some(points) = det.polygon.as_ref().and_then(|p| p.to_pixel_points()) else {
            continue;
        };
        draw_polygon_mut(&mut mask_all, &points, Luma([255]));
        if flags.segment {
            draw_polygon_mut(&mut overlay, &points, class_color(det.class_id));
        }
        any_mask = true;
    }

    // 3. 检测区域贴回原图 (着色基于原图, 而非模糊图)
    if any_mask {
        let alpha = flags.tint_alpha;
        for (x, y, m) in mask_all.enumerate_pixels() {
            if m[0] == 0 {
                continue;
            }
            let src = frame.get_pixel(x, y);
            let px = if flags.segment {
                let tint = overlay.get_pixel(x, y);
                Rgb([
                    blend(src[0], tint[0], alpha),
                    blend(src[1], tint[1], alpha),
                    blend(src[2], tint[2], alpha),
                ])
            } else {
                *src
            };
            result.put_pixel(x, y, px);
        }
    }

    // 4. 最后绘制框与标签
    for det in detections {
        let color = class_color(det.class_id);
        if flags.boxes {
            draw_box(&mut result, &det.bbox, color, BOX_THICKNESS);
        }
        if flags.labels {
            if let Some(font) = font {
                draw_centered_label(&mut result, font, &det.label, &det.bbox, color);
            }
        }
    }

    Ok(result)
}

/// 身份叠加层: 轨迹框 + "姓名 #ID"
///
/// 搜索目标使用红色粗框
pub fn overlay_tracks(
    image: &mut RgbImage,
    tracks: &[TrackedObject],
    targets: &HashSet<String>,
    font: Option<&LabelFont>,
) {
    for track in tracks {
        let TrackKey::Live(id) = track.key else {
            continue;
        };
        let is_target = targets.contains(&track.name);
        let (color, thickness) = if is_target {
            (Rgb([255, 0, 0]), TARGET_BOX_THICKNESS)
        } else {
            (Rgb(id_to_color(id)), 1)
        };
        draw_box(image, &track.bbox, color, thickness);

        if let Some(font) = font {
            let caption = format!("{} #{}", track.name, id);
            let (tw, th) = font.measure(&caption);
            let (iw, ih) = image.dimensions();
            let x = clamp_i32(track.bbox.x() as i32, 0, iw as i32 - tw as i32);
            let y = clamp_i32(
                track.bbox.y() as i32 - th as i32 - 2,
                0,
                ih as i32 - th as i32,
            );
            font.draw_outlined(image, &caption, x, y, color);
        }
    }
}

/// 告警横幅
pub fn overlay_alert(image: &mut RgbImage, message: &str, font: Option<&LabelFont>) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let banner_h = ALERT_BANNER_HEIGHT.min(h);
    draw_filled_rect_mut(
        image,
        Rect::at(0, 0).of_size(w, banner_h),
        Rgb([180, 0, 0]),
    );
    if let Some(font) = font {
        let (tw, th) = font.measure(message);
        let x = clamp_i32((w as i32 - tw as i32) / 2, 0, w as i32);
        let y = clamp_i32((banner_h as i32 - th as i32) / 2, 0, h as i32);
        font.draw(image, message, x, y, Rgb([255, 255, 255]));
    }
}

/// 画框 (裁剪到画面内)
fn draw_box(image: &mut RgbImage, bbox: &BBox, color: Rgb<u8>, thickness: i32) {
    let (w, h) = image.dimensions();
    let b = bbox.clamp_to(w, h);
    let x1 = b.x() as i32;
    let y1 = b.y() as i32;
    let x2 = (b.x2() as i32).min(w as i32 - 1);
    let y2 = (b.y2() as i32).min(h as i32 - 1);
    for t in 0..thickness {
        let (rw, rh) = (x2 - x1 - 2 * t, y2 - y1 - 2 * t);
        if rw <= 0 || rh <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at(x1 + t, y1 + t).of_size(rw as u32 + 1, rh as u32 + 1),
            color,
        );
    }
}

/// 标签锚定在框中心, 并限制在画面内
fn draw_centered_label(
    image: &mut RgbImage,
    font: &LabelFont,
    text: &str,
    bbox: &BBox,
    color: Rgb<u8>,
) {
    let (w, h) = image.dimensions();
    let (tw, th) = font.measure(text);
    let (cx, cy) = bbox.center();
    let x = clamp_i32(cx as i32 - tw as i32 / 2, 0, w as i32 - tw as i32);
    let y = clamp_i32(cy as i32 - th as i32 / 2, 0, h as i32 - th as i32);
    font.draw_outlined(image, text, x, y, color);
}

fn blend(src: u8, tint: u8, alpha: f32) -> u8 {
    (src as f32 * (1.0 - alpha) + tint as f32 * alpha).round() as u8
}

/// 文字比画面宽时贴左/上
fn clamp_i32(v: i32, lo: i32, hi: i32) -> i32 {
    v.min(hi).max(lo)
}
