// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/output/directory_record.rs - 按日期归档节拍结果
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

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{COCO_CLASSES, Detection},
  output::{Render, TickOverlay},
  url_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 检测结果文本记录，格式可被 `record://` 检测器回放
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  fn label(&self, class: &str) -> String {
    if self.label_with_name {
      return class.to_string();
    }
    COCO_CLASSES
      .iter()
      .position(|c| *c == class)
      .map(|id| id.to_string())
      .unwrap_or_else(|| class.to_string())
  }

  pub fn record(
    &self,
    detections: &[Detection],
    frame_width: u32,
    frame_height: u32,
    image_path: &Path,
  ) -> Result<(), std::io::Error> {
    let mut file = std::fs::File::create(image_path.with_extension("txt"))?;
    for detection in detections {
      let [x_min, y_min, x_max, y_max] = detection.bbox.to_normalized(frame_width, frame_height);
      writeln!(
        file,
        "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
        self.label(&detection.class),
        detection.confidence,
        x_min,
        y_min,
        x_max,
        y_max
      )?;
    }
    Ok(())
  }
}

pub enum DrawWrapper {
  /// 保存叠加后的画面
  Draw,
  /// 保存原始画面与文本记录
  Record(Record),
}

impl DrawWrapper {
  pub fn with(kind: Option<&str>) -> Self {
    match kind {
      Some("id") => DrawWrapper::Record(Record {
        label_with_name: false,
      }),
      Some(_) => DrawWrapper::Record(Record {
        label_with_name: true,
      }),
      None => DrawWrapper::Draw,
    }
  }

  pub fn save_result(
    &self,
    path: &Path,
    frame: &Frame,
    overlay: &TickOverlay<'_>,
  ) -> Result<(), DirectoryRecordOutputError> {
    match self {
      DrawWrapper::Draw => {
        overlay.surface.composite(&frame.image).save(path)?;
      }
      DrawWrapper::Record(record) => {
        frame.image.save(path)?;
        record.record(overlay.detections, frame.width(), frame.height(), path)?;
      }
    }
    Ok(())
  }
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: DrawWrapper,
  frame_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let kind = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| v.into_owned());
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_path(uri)),
      draw: DrawWrapper::with(kind.as_deref()),
      frame_counter: AtomicU16::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, std::io::Error> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &Frame, overlay: &TickOverlay<'_>) -> Result<(), Self::Error> {
    if !self.always && overlay.detections.is_empty() {
      return Ok(());
    }
    let path = self.frame_path()?;
    self.draw.save_result(&path, frame, overlay)?;
    debug!("归档节拍 {}: {}", overlay.tick, path.display());
    Ok(())
  }
}
