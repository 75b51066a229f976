// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/output.rs - 叠加层与输出定义
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

use image::{Rgb, RgbImage, Rgba, RgbaImage};
use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "directory_record"))]
use crate::FromUrlWithScheme;
use crate::frame::Frame;
use crate::model::Detection;
use crate::tally::TallyResult;

/// 与视频帧对齐的透明绘图层
#[derive(Debug, Clone)]
pub struct OverlaySurface {
  canvas: RgbaImage,
}

impl OverlaySurface {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      canvas: RgbaImage::new(width, height),
    }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.canvas.dimensions()
  }

  /// 尺寸与视频源不一致时重新分配（同时清空），返回是否发生了变化
  pub fn sync_dimensions(&mut self, width: u32, height: u32) -> bool {
    if self.canvas.dimensions() == (width, height) {
      return false;
    }
    self.canvas = RgbaImage::new(width, height);
    true
  }

  pub fn clear(&mut self) {
    self
      .canvas
      .pixels_mut()
      .for_each(|p| *p = Rgba([0, 0, 0, 0]));
  }

  pub fn is_blank(&self) -> bool {
    self.canvas.pixels().all(|p| p.0[3] == 0)
  }

  pub fn canvas(&self) -> &RgbaImage {
    &self.canvas
  }

  pub fn canvas_mut(&mut self) -> &mut RgbaImage {
    &mut self.canvas
  }

  /// 将叠加层混合到帧上，只处理两者重叠的区域
  pub fn composite(&self, frame: &RgbImage) -> RgbImage {
    let mut image = frame.clone();
    let width = image.width().min(self.canvas.width());
    let height = image.height().min(self.canvas.height());

    for y in 0..height {
      for x in 0..width {
        let Rgba([r, g, b, a]) = *self.canvas.get_pixel(x, y);
        if a == 0 {
          continue;
        }
        let alpha = a as f32 / 255.0;
        let Rgb(base) = image.get_pixel_mut(x, y);
        for (c, v) in base.iter_mut().zip([r, g, b]) {
          *c = (v as f32 * alpha + *c as f32 * (1.0 - alpha)).round() as u8;
        }
      }
    }
    image
  }
}

/// 一个节拍交给输出的全部内容
pub struct TickOverlay<'a> {
  pub tick: u64,
  pub surface: &'a OverlaySurface,
  pub detections: &'a [Detection],
  pub tally: &'a TallyResult,
}

/// 节拍结果的持久化输出
pub trait Render: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;
  fn render_result(&self, frame: &Frame, overlay: &TickOverlay<'_>) -> Result<(), Self::Error>;
}

impl<R: Render> Render for Option<R> {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, overlay: &TickOverlay<'_>) -> Result<(), Self::Error> {
    match self {
      Some(output) => output.render_result(frame, overlay),
      None => Ok(()),
    }
  }
}

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &Frame, overlay: &TickOverlay<'_>) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, overlay)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, overlay)
        .map_err(OutputError::from),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = (frame, overlay);
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sync_only_reallocates_on_change() {
    let mut surface = OverlaySurface::new(0, 0);
    assert!(surface.sync_dimensions(640, 480));
    surface.canvas_mut().put_pixel(1, 1, Rgba([255, 0, 0, 255]));
    assert!(!surface.sync_dimensions(640, 480));
    assert!(!surface.is_blank());
    assert!(surface.sync_dimensions(320, 240));
    assert!(surface.is_blank());
    assert_eq!(surface.dimensions(), (320, 240));
  }

  #[test]
  fn clear_erases_everything() {
    let mut surface = OverlaySurface::new(4, 4);
    surface.canvas_mut().put_pixel(3, 3, Rgba([0, 255, 255, 255]));
    surface.clear();
    assert!(surface.is_blank());
  }

  #[test]
  fn composite_blends_opaque_pixels_only() {
    let frame = RgbImage::from_pixel(3, 3, Rgb([10, 10, 10]));
    let mut surface = OverlaySurface::new(2, 2);
    surface.canvas_mut().put_pixel(0, 0, Rgba([255, 0, 0, 255]));
    surface.canvas_mut().put_pixel(1, 0, Rgba([255, 255, 255, 0]));

    let out = surface.composite(&frame);
    assert_eq!(out.get_pixel(0, 0).0, [255, 0, 0]);
    assert_eq!(out.get_pixel(1, 0).0, [10, 10, 10]);
    assert_eq!(out.get_pixel(2, 2).0, [10, 10, 10]);
  }

  #[test]
  fn missing_output_renders_nothing() {
    let frame = Frame::new(RgbImage::new(2, 2), 0, 0);
    let surface = OverlaySurface::new(2, 2);
    let tally = TallyResult::default();
    let overlay = TickOverlay {
      tick: 0,
      surface: &surface,
      detections: &[],
      tally: &tally,
    };
    let output: Option<OutputWrapper> = None;
    assert!(output.render_result(&frame, &overlay).is_ok());
    assert!(matches!(
      OutputWrapper::from_url(&Url::parse("rtsp://host/live").unwrap()),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
