// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! YOLOE 分割模型前后处理
//!
//! 输出布局 (与 YOLOv8-seg 相同):
//! - output0: [1, 4 + nc + nm, N]  (cx, cy, w, h, 类别分数..., 掩码系数...)
//! - output1: [1, nm, mh, mw]       掩码原型

use fast_image_resize as fr;
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use ndarray::{s, Array, Array2, Axis, IxDyn};

use crate::detection::types::{BBox, Detection, Keypoint, Polygon};
use crate::error::{Result, SentinelError};
use crate::non_max_suppression;

const CXYWH_OFFSET: usize = 4;
const KPT_STEP: usize = 3;

/// 模型原始输出 (未解码)
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub preds: Array<f32, IxDyn>,
    pub protos: Option<Array<f32, IxDyn>>,
    /// 每个候选携带的关键点数量 (附在掩码系数之后)
    pub num_keypoints: usize,
}

impl RawOutput {
    /// 空输出: 没有任何候选框
    pub fn empty(num_classes: usize) -> Self {
        Self {
            preds: Array::zeros(IxDyn(&[1, CXYWH_OFFSET + num_classes, 0])),
            protos: None,
            num_keypoints: 0,
        }
    }
}

/// 后处理阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeThresholds {
    pub confidence: f32,
    pub iou: f32,
}

/// letterbox 几何: 源图与模型输入之间的坐标映射
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub size: u32,
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub resized_w: u32,
    pub resized_h: u32,
    pub src_w: u32,
    pub src_h: u32,
}

impl Letterbox {
    /// 保持宽高比缩放到 size, 居中填充
    pub fn new(src_w: u32, src_h: u32, size: u32) -> Self {
        let scale = size as f32 / src_w.max(src_h).max(1) as f32;
        let resized_w = ((src_w as f32 * scale).round() as u32).clamp(1, size);
        let resized_h = ((src_h as f32 * scale).round() as u32).clamp(1, size);
        Self {
            size,
            scale,
            pad_x: (size - resized_w) / 2,
            pad_y: (size - resized_h) / 2,
            resized_w,
            resized_h,
            src_w,
            src_h,
        }
    }

    /// 模型输入坐标 → 源图坐标 (不裁剪)
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }

    fn clamp_point(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            x.clamp(0.0, self.src_w as f32),
            y.clamp(0.0, self.src_h as f32),
        )
    }
}

/// 预处理: letterbox + 归一化, 输出 NCHW 张量
pub fn preprocess(image: &RgbImage, size: u32) -> Result<(Array<f32, IxDyn>, Letterbox)> {
    let (w0, h0) = image.dimensions();
    if w0 == 0 || h0 == 0 {
        return Err(SentinelError::Render("空图像".to_string()));
    }
    let geometry = Letterbox::new(w0, h0, size);

    let src = fr::images::Image::from_vec_u8(w0, h0, image.as_raw().clone(), fr::PixelType::U8x3)
        .map_err(|e| SentinelError::Render(format!("缩放源图像创建失败: {}", e)))?;
    let mut dst = fr::images::Image::new(
        geometry.resized_w,
        geometry.resized_h,
        fr::PixelType::U8x3,
    );
    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| SentinelError::Render(format!("缩放失败: {}", e)))?;

    // 黑色填充
    let mut xs = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
    let rw = geometry.resized_w as usize;
    let (px, py) = (geometry.pad_x as usize, geometry.pad_y as usize);
    for (i, rgb) in dst.buffer().chunks_exact(3).enumerate() {
        let x = px + i % rw;
        let y = py + i / rw;
        xs[[0, 0, y, x]] = rgb[0] as f32 / 255.0;
        xs[[0, 1, y, x]] = rgb[1] as f32 / 255.0;
        xs[[0, 2, y, x]] = rgb[2] as f32 / 255.0;
    }

    Ok((xs, geometry))
}

/// 后处理: 置信度过滤 → 类别无关 NMS → 掩码解码 → 轮廓多边形
///
/// 纯函数, 只依赖输入与阈值
pub fn decode(
    raw: &RawOutput,
    thresholds: DecodeThresholds,
    geometry: &Letterbox,
    classes: &[String],
) -> Result<Vec<Detection>> {
    let preds = &raw.preds;
    if preds.ndim() != 3 || preds.shape()[0] != 1 {
        return Err(shape_error());
    }
    let channels = preds.shape()[1];
    let nc = classes.len();
    let nm = match &raw.protos {
        Some(p) if p.ndim() == 4 => p.shape()[1],
        Some(_) => return Err(shape_error()),
        None => 0,
    };
    if channels != CXYWH_OFFSET + nc + nm + KPT_STEP * raw.num_keypoints {
        return Err(shape_error());
    }

    let anchor = preds.index_axis(Axis(0), 0);
    let mut data: Vec<(Detection, Vec<f32>)> = Vec::new();
    for pred in anchor.axis_iter(Axis(1)) {
        let scores = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);
        let Some((class_id, &confidence)) = scores
            .iter()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };
        if confidence < thresholds.confidence {
            continue;
        }

        let (cx, cy, w, h) = (pred[0], pred[1], pred[2], pred[3]);
        let (x1, y1) = geometry.clamp_point(geometry.to_source(cx - w / 2.0, cy - h / 2.0));
        let (x2, y2) = geometry.clamp_point(geometry.to_source(cx + w / 2.0, cy + h / 2.0));
        let bbox = BBox::from_xyxy(x1, y1, x2, y2, confidence);
        if bbox.area() <= 0.0 {
            continue;
        }

        let coef_start = CXYWH_OFFSET + nc;
        let coefs = pred.slice(s![coef_start..coef_start + nm]).to_vec();

        let kpt_start = coef_start + nm;
        let keypoints = (0..raw.num_keypoints)
            .map(|i| {
                let base = kpt_start + KPT_STEP * i;
                let (kx, ky) = geometry.clamp_point(geometry.to_source(pred[base], pred[base + 1]));
                Keypoint {
                    x: kx,
                    y: ky,
                    confidence: pred[base + 2],
                }
            })
            .collect();

        let detection = Detection::new(class_id, classes[class_id].clone(), bbox)
            .with_keypoints(keypoints);
        data.push((detection, coefs));
    }

    non_max_suppression(&mut data, thresholds.iou, |(d, _)| &d.bbox);

    let mut detections = Vec::with_capacity(data.len());
    for (detection, coefs) in data {
        let polygon = match &raw.protos {
            Some(protos) if nm > 0 => mask_polygon(protos, &coefs, &detection.bbox, geometry)?,
            _ => None,
        };
        detections.push(match polygon {
            Some(p) => detection.with_polygon(p),
            None => detection,
        });
    }
    Ok(detections)
}

/// 掩码系数 · 原型 → 二值掩码 → 最大外轮廓
fn mask_polygon(
    protos: &Array<f32, IxDyn>,
    coefs: &[f32],
    bbox: &BBox,
    geometry: &Letterbox,
) -> Result<Option<Polygon>> {
    let proto = protos.index_axis(Axis(0), 0);
    let (nm, mh, mw) = (proto.shape()[0], proto.shape()[1], proto.shape()[2]);
    let proto = proto.to_owned().into_shape_with_order((nm, mh * mw))?;
    let coefs = Array2::from_shape_vec((1, nm), coefs.to_vec())?;
    let logits = coefs.dot(&proto);

    // 原型分辨率与模型输入的比例
    let ratio = mw as f32 / geometry.size as f32;
    let to_proto = |x: f32, y: f32| {
        (
            (x * geometry.scale + geometry.pad_x as f32) * ratio,
            (y * geometry.scale + geometry.pad_y as f32) * ratio,
        )
    };
    let (bx1, by1) = to_proto(bbox.x(), bbox.y());
    let (bx2, by2) = to_proto(bbox.x2(), bbox.y2());

    let mut mask = GrayImage::new(mw as u32, mh as u32);
    let mut any = false;
    for (i, &logit) in logits.iter().enumerate() {
        let (x, y) = ((i % mw) as f32 + 0.5, (i / mw) as f32 + 0.5);
        // sigmoid > 0.5 且在检测框内
        if logit > 0.0 && x >= bx1 && x <= bx2 && y >= by1 && y <= by2 {
            mask.put_pixel((i % mw) as u32, (i / mw) as u32, Luma([255]));
            any = true;
        }
    }
    if !any {
        return Ok(None);
    }

    let contour = find_contours::<i32>(&mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.points.len() >= 3)
        .max_by_key(|c| c.points.len());

    Ok(contour.map(|c| {
        let points = c
            .points
            .iter()
            .map(|p| {
                let x = (p.x as f32 + 0.5) / ratio;
                let y = (p.y as f32 + 0.5) / ratio;
                geometry.clamp_point(geometry.to_source(x, y))
            })
            .collect();
        Polygon::new(points)
    }))
}

fn shape_error() -> SentinelError {
    SentinelError::Shape(ndarray::ShapeError::from_kind(
        ndarray::ErrorKind::IncompatibleShape,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Vec<String> {
        vec!["person".to_string(), "dog".to_string()]
    }

    /// 构造单候选输出: [cx, cy, w, h, s0, s1]
    fn single_candidate(values: [f32; 6]) -> RawOutput {
        let preds = Array::from_shape_vec(IxDyn(&[1, 6, 1]), values.to_vec()).unwrap();
        RawOutput {
            preds,
            protos: None,
            num_keypoints: 0,
        }
    }

    #[test]
    fn test_letterbox_geometry() {
        let g = Letterbox::new(1280, 720, 640);
        assert_eq!(g.resized_w, 640);
        assert_eq!(g.resized_h, 360);
        assert_eq!(g.pad_x, 0);
        assert_eq!(g.pad_y, 140);
        let (x, y) = g.to_source(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 360.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_black_frame() {
        let image = RgbImage::new(640, 480);
        let (xs, g) = preprocess(&image, 640).unwrap();
        assert_eq!(xs.shape(), &[1, 3, 640, 640]);
        assert_eq!(g.pad_y, 80);
        assert!(xs.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_low_score_filtered_by_high_threshold() {
        let raw = single_candidate([320.0, 320.0, 100.0, 100.0, 0.5, 0.1]);
        let g = Letterbox::new(640, 640, 640);
        let thresholds = DecodeThresholds {
            confidence: 0.9,
            iou: 0.7,
        };
        assert!(decode(&raw, thresholds, &g, &classes()).unwrap().is_empty());
    }

    #[test]
    fn test_decode_maps_back_to_source() {
        let raw = single_candidate([320.0, 320.0, 100.0, 50.0, 0.2, 0.8]);
        let g = Letterbox::new(1280, 720, 640);
        let thresholds = DecodeThresholds {
            confidence: 0.25,
            iou: 0.7,
        };
        let dets = decode(&raw, thresholds, &g, &classes()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "dog");
        assert!((dets[0].bbox.width() - 200.0).abs() < 1e-3);
        assert!((dets[0].bbox.height() - 100.0).abs() < 1e-3);
        assert!(dets[0].polygon.is_none());
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let raw = single_candidate([0.0; 6]);
        let g = Letterbox::new(640, 640, 640);
        let thresholds = DecodeThresholds {
            confidence: 0.25,
            iou: 0.7,
        };
        assert!(decode(&raw, thresholds, &g, &["person".to_string()]).is_err());
    }

    #[test]
    fn test_mask_becomes_polygon() {
        // 1个原型通道, 160x160, 中间 40x40 区域为正
        let (mh, mw) = (160usize, 160usize);
        let mut protos = Array::from_elem(IxDyn(&[1, 1, mh, mw]), -1.0f32);
        for y in 60..100 {
            for x in 60..100 {
                protos[[0, 0, y, x]] = 1.0;
            }
        }
        let preds = Array::from_shape_vec(
            IxDyn(&[1, 4 + 2 + 1, 1]),
            vec![320.0, 320.0, 200.0, 200.0, 0.9, 0.0, 1.0],
        )
        .unwrap();
        let raw = RawOutput {
            preds,
            protos: Some(protos),
            num_keypoints: 0,
        };
        let g = Letterbox::new(640, 640, 640);
        let thresholds = DecodeThresholds {
            confidence: 0.25,
            iou: 0.7,
        };
        let dets = decode(&raw, thresholds, &g, &classes()).unwrap();
        let polygon = dets[0].polygon.as_ref().unwrap();
        assert!(polygon.len() >= 4);
        for &(x, y) in polygon.points() {
            assert!((238.0..=402.0).contains(&x), "x={}", x);
            assert!((238.0..=402.0).contains(&y), "y={}", y);
        }
    }
}
