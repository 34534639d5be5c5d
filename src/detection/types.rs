// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统数据结构定义
/// Data structures shared by engine, tracker and compositor
use std::sync::Arc;

use image::RgbImage;
use imageproc::point::Point;

// ========== 数据结构 ==========

/// 检测框 (x, y, w, h) + 置信度
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    confidence: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            w: w.max(0.0),
            h: h.max(0.0),
            confidence,
        }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1, confidence)
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn width(&self) -> f32 {
        self.w
    }

    pub fn height(&self) -> f32 {
        self.h
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn intersection_area(&self, another: &BBox) -> f32 {
        let l = self.x.max(another.x);
        let r = self.x2().min(another.x2());
        let t = self.y.max(another.y);
        let b = self.y2().min(another.y2());
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    pub fn iou(&self, another: &BBox) -> f32 {
        let inter = self.intersection_area(another);
        let union = self.area() + another.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// 裁剪到画面范围内
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = self.x2().clamp(0.0, w);
        let y2 = self.y2().clamp(0.0, h);
        BBox::from_xyxy(x1, y1, x2, y2, self.confidence)
    }
}

/// 关键点 (x, y, conf)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// 分割多边形 (源图坐标)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polygon {
    points: Vec<(f32, f32)>,
}

impl Polygon {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 转为 imageproc 绘制用的整数顶点
    ///
    /// 去除相邻重复点与首尾闭合点; 少于3个顶点时返回 None
    pub fn to_pixel_points(&self) -> Option<Vec<Point<i32>>> {
        let mut pts: Vec<Point<i32>> = Vec::with_capacity(self.points.len());
        for &(x, y) in &self.points {
            let p = Point::new(x.round() as i32, y.round() as i32);
            if pts.last() != Some(&p) {
                pts.push(p);
            }
        }
        while pts.len() > 1 && pts.first() == pts.last() {
            pts.pop();
        }
        if pts.len() < 3 {
            return None;
        }
        Some(pts)
    }
}

/// 单个检测结果 (一经创建不可变)
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub bbox: BBox,
    pub keypoints: Vec<Keypoint>,
    pub polygon: Option<Polygon>,
}

impl Detection {
    pub fn new(class_id: usize, label: impl Into<String>, bbox: BBox) -> Self {
        Self {
            class_id,
            label: label.into(),
            bbox,
            keypoints: Vec::new(),
            polygon: None,
        }
    }

    pub fn with_polygon(mut self, polygon: Polygon) -> Self {
        self.polygon = Some(polygon);
        self
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Keypoint>) -> Self {
        self.keypoints = keypoints;
        self
    }

    pub fn confidence(&self) -> f32 {
        self.bbox.confidence()
    }
}

/// 视频帧: 不可变 RGB 图像 + 单调递增序号
///
/// 所有权随队列在阶段间转移, 图像本身只读共享
#[derive(Debug, Clone)]
pub struct Frame {
    seq: u64,
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self {
            seq,
            image: Arc::new(image),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn image(&self) -> &Arc<RgbImage> {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// 渲染状态
#[derive(Debug, Clone, PartialEq)]
pub enum RenderStatus {
    Rendered,
    /// 渲染失败, 输出的是未标注的源帧
    Degraded(String),
}

/// 推理结果 (推理引擎 → 跟踪器)
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    /// 合成后的图像; 渲染失败时与源帧相同
    pub image: Arc<RgbImage>,
    pub render: RenderStatus,
    /// 处理该帧时生效的类别配置代数
    pub generation: u64,
    pub classes: Arc<[String]>,
    pub inference_ms: f64,
}

impl AnnotatedFrame {
    pub fn seq(&self) -> u64 {
        self.frame.seq()
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.render, RenderStatus::Degraded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BBox::new(10.0, 10.0, 20.0, 20.0, 1.0);
        let b = BBox::new(100.0, 100.0, 20.0, 20.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_clamp_to_frame() {
        let b = BBox::new(-10.0, 5.0, 50.0, 500.0, 0.5).clamp_to(30, 100);
        assert_eq!(b.x(), 0.0);
        assert_eq!(b.x2(), 30.0);
        assert_eq!(b.y2(), 100.0);
        assert_eq!(b.confidence(), 0.5);
    }

    #[test]
    fn test_polygon_drops_closing_point() {
        let poly = Polygon::new(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 0.0)]);
        let pts = poly.to_pixel_points().unwrap();
        assert_eq!(pts.len(), 3);

        let degenerate = Polygon::new(vec![(1.0, 1.0), (1.2, 1.1)]);
        assert!(degenerate.to_pixel_points().is_none());
    }
}
