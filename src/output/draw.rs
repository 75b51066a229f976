// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/output/draw.rs - 检测框与超限提示绘制
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{info, warn};

use crate::{model::Detection, output::OverlaySurface, tally::TallyResult};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_CHAR_WIDTH: f32 = 9.0; // 字体不可用时每字符平均宽度（粗略估计）
const LABEL_PADDING: u32 = 4;
const LINE_WIDTH: i32 = 4;
const WARNING_OFFSET: i32 = 20;

static DEFAULT_FONT: &[u8] = include_bytes!("../../assets/font.ttf"); // default font

pub const WARNING_MESSAGE: &str = "You have exceeded the limit";

const EXCEEDED_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]); // #FF0000
const NORMAL_COLOR: Rgba<u8> = Rgba([0, 255, 255, 255]); // #00FFFF
const TEXT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Error, Debug)]
pub enum FontError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体无效: {0}")]
  Invalid(#[from] ab_glyph::InvalidFont),
}

/// 叠加层绘制器
///
/// 默认使用内嵌字体，`with_font_file` 可替换为其他字体。
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
}

impl Default for Draw {
  fn default() -> Self {
    let font = match FontArc::try_from_slice(DEFAULT_FONT) {
      Ok(font) => Some(font),
      Err(e) => {
        warn!("内嵌字体无效，叠加层将不绘制文字: {}", e);
        None
      }
    };
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
    }
  }
}

impl Draw {
  pub fn with_font_file(path: impl AsRef<Path>) -> Result<Self, FontError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontArc::try_from_vec(data)?;
    info!("加载叠加层字体: {}", path.as_ref().display());
    Ok(Self {
      font: Some(font),
      font_size: LABEL_FONT_SIZE,
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  fn measure(&self, text: &str) -> (u32, u32) {
    let scale = PxScale::from(self.font_size);
    match &self.font {
      Some(font) => text_size(scale, font, text),
      None => (
        (text.chars().count() as f32 * LABEL_CHAR_WIDTH) as u32,
        self.font_size as u32,
      ),
    }
  }

  fn text(&self, canvas: &mut RgbaImage, color: Rgba<u8>, x: i32, y: i32, text: &str) {
    if let Some(font) = &self.font {
      draw_text_mut(canvas, color, x, y, PxScale::from(self.font_size), font, text);
    }
  }

  /// 清除上一个节拍的绘制内容，再绘制本节拍的检测结果
  pub fn render(&self, detections: &[Detection], tally: &TallyResult, surface: &mut OverlaySurface) {
    surface.clear();
    let canvas = surface.canvas_mut();
    if canvas.width() == 0 || canvas.height() == 0 {
      return;
    }

    for detection in detections {
      let exceeded = tally.is_exceeded(&detection.class);
      self.draw_detection(canvas, detection, exceeded);
    }
  }

  fn draw_detection(&self, canvas: &mut RgbaImage, detection: &Detection, exceeded: bool) {
    let color = if exceeded {
      EXCEEDED_COLOR
    } else {
      NORMAL_COLOR
    };

    let x = detection.bbox.x.round() as i32;
    let y = detection.bbox.y.round() as i32;
    let width = detection.bbox.width.round() as i32;
    let height = detection.bbox.height.round() as i32;

    // 边框（向内加粗）
    for t in 0..LINE_WIDTH {
      let (w, h) = (width - 2 * t, height - 2 * t);
      if w <= 0 || h <= 0 {
        break;
      }
      draw_hollow_rect_mut(
        canvas,
        Rect::at(x + t, y + t).of_size(w as u32, h as u32),
        color,
      );
    }

    // 标签底色与类别名
    let (text_width, text_height) = self.measure(&detection.class);
    draw_filled_rect_mut(
      canvas,
      Rect::at(x, y).of_size(text_width + LABEL_PADDING, text_height + LABEL_PADDING),
      color,
    );
    self.text(canvas, TEXT_COLOR, x, y, &detection.class);

    if exceeded {
      self.text(
        canvas,
        EXCEEDED_COLOR,
        x,
        y + height + WARNING_OFFSET,
        WARNING_MESSAGE,
      );
    }
  }
}
