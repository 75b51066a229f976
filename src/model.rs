// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/model.rs - 检测模型适配
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{FromUrl, frame::Frame};

/// 边界框（源图像像素坐标，左上角 + 宽高）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由归一化的 [x_min, y_min, x_max, y_max] 换算到像素坐标
  pub fn from_normalized(bbox: [f32; 4], frame_width: u32, frame_height: u32) -> Self {
    let (w, h) = (frame_width as f32, frame_height as f32);
    Self {
      x: bbox[0] * w,
      y: bbox[1] * h,
      width: (bbox[2] - bbox[0]).max(0.0) * w,
      height: (bbox[3] - bbox[1]).max(0.0) * h,
    }
  }

  /// 换算为归一化的 [x_min, y_min, x_max, y_max]
  pub fn to_normalized(&self, frame_width: u32, frame_height: u32) -> [f32; 4] {
    let (w, h) = (frame_width.max(1) as f32, frame_height.max(1) as f32);
    [
      self.x / w,
      self.y / h,
      (self.x + self.width) / w,
      (self.y + self.height) / h,
    ]
  }
}

/// 单帧中的一次检测
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class: String,
  /// 置信度 (0.0 - 1.0)
  pub confidence: f32,
  pub bbox: BoundingBox,
}

impl Detection {
  pub fn new(class: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
    Self {
      class: class.into(),
      confidence,
      bbox,
    }
  }
}

/// 已加载的检测模型
///
/// 同一个实例不会被并发调用，会话保证同一时刻最多一次推理。
pub trait Detector: Send + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(
    &self,
    frame: &Frame,
    max_detections: usize,
    min_confidence: f32,
  ) -> Result<Vec<Detection>, Self::Error>;
}

/// 模型构建器，每个会话只构建一次
pub trait DetectorBuilder: Send + 'static {
  type Detector: Detector;

  fn build(self) -> Result<Self::Detector, LoadError>;
}

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型路径方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  InvalidModel(String),
  #[error("模型加载任务异常退出: {0}")]
  Join(String),
}

/// 在阻塞线程池中加载模型
pub async fn load_detector<B: DetectorBuilder>(builder: B) -> Result<B::Detector, LoadError> {
  let now = std::time::Instant::now();
  let detector = tokio::task::spawn_blocking(move || builder.build())
    .await
    .map_err(|e| LoadError::Join(e.to_string()))??;
  info!("模型加载完成，耗时: {:.2?}", now.elapsed());
  Ok(detector)
}

/// 加载失败时重试，最多额外尝试 `retries` 次
pub async fn load_detector_with_retries<B>(
  builder: B,
  retries: u32,
  backoff: std::time::Duration,
) -> Result<B::Detector, LoadError>
where
  B: DetectorBuilder + Clone,
{
  let mut attempt = 0;
  loop {
    match load_detector(builder.clone()).await {
      Ok(detector) => return Ok(detector),
      Err(e) if attempt < retries => {
        attempt += 1;
        warn!("模型加载失败 ({}/{}): {}，{:?} 后重试", attempt, retries, e, backoff);
        tokio::time::sleep(backoff).await;
      }
      Err(e) => return Err(e),
    }
  }
}

/// 丢弃低置信度结果，按置信度降序保留前 `max_detections` 个
pub fn retain_top(
  mut detections: Vec<Detection>,
  max_detections: usize,
  min_confidence: f32,
) -> Vec<Detection> {
  detections.retain(|d| d.confidence >= min_confidence);
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
  detections.truncate(max_detections);
  detections
}

mod record;
pub use self::record::{RecordDetector, RecordDetectorBuilder, RecordDetectorError};

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("回放检测错误: {0}")]
  Record(#[from] RecordDetectorError),
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 推理错误: {0}")]
  Yolo26(#[from] Yolo26Error),
}

pub enum DetectorWrapperBuilder {
  Record(RecordDetectorBuilder),
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26Builder),
}

pub enum DetectorWrapper {
  Record(RecordDetector),
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26),
}

impl FromUrl for DetectorWrapperBuilder {
  type Error = LoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      RecordDetectorBuilder::SCHEME => Ok(DetectorWrapperBuilder::Record(
        RecordDetectorBuilder::from_url(url)?,
      )),
      #[cfg(feature = "model_yolo26")]
      Yolo26Builder::SCHEME => Ok(DetectorWrapperBuilder::Yolo26(Yolo26Builder::from_url(
        url,
      )?)),
      scheme => Err(LoadError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl Clone for DetectorWrapperBuilder {
  fn clone(&self) -> Self {
    match self {
      DetectorWrapperBuilder::Record(builder) => DetectorWrapperBuilder::Record(builder.clone()),
      #[cfg(feature = "model_yolo26")]
      DetectorWrapperBuilder::Yolo26(builder) => DetectorWrapperBuilder::Yolo26(builder.clone()),
    }
  }
}

impl DetectorBuilder for DetectorWrapperBuilder {
  type Detector = DetectorWrapper;

  fn build(self) -> Result<Self::Detector, LoadError> {
    match self {
      DetectorWrapperBuilder::Record(builder) => builder.build().map(DetectorWrapper::Record),
      #[cfg(feature = "model_yolo26")]
      DetectorWrapperBuilder::Yolo26(builder) => builder.build().map(DetectorWrapper::Yolo26),
    }
  }
}

impl Detector for DetectorWrapper {
  type Error = DetectorError;

  fn detect(
    &self,
    frame: &Frame,
    max_detections: usize,
    min_confidence: f32,
  ) -> Result<Vec<Detection>, Self::Error> {
    match self {
      DetectorWrapper::Record(detector) => detector
        .detect(frame, max_detections, min_confidence)
        .map_err(DetectorError::from),
      #[cfg(feature = "model_yolo26")]
      DetectorWrapper::Yolo26(detector) => detector
        .detect(frame, max_detections, min_confidence)
        .map_err(DetectorError::from),
    }
  }
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];
