// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/input/frame_directory.rs - 图片目录回放输入
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

use std::path::PathBuf;
use std::time::Instant;

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, input::VideoSource, url_path};

#[derive(Error, Debug)]
pub enum FrameDirectoryInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("目录中没有图片: {0}")]
  Empty(String),
}

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 按文件名顺序循环回放目录中的图片
///
/// 尺寸取自第一张图片；后续读取失败的帧会被跳过（返回 `None`）。
pub struct FrameDirectoryInput {
  files: Vec<PathBuf>,
  cursor: usize,
  dimensions: (u32, u32),
  index: u64,
  opened: Instant,
}

impl FromUrlWithScheme for FrameDirectoryInput {
  const SCHEME: &'static str = "frames";
}

impl FromUrl for FrameDirectoryInput {
  type Error = FrameDirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(FrameDirectoryInputError::SchemaMismatch);
    }

    let directory = url_path(url);
    let mut files = std::fs::read_dir(&directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| {
        path
          .extension()
          .and_then(|ext| ext.to_str())
          .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
          .unwrap_or(false)
      })
      .collect::<Vec<_>>();
    files.sort();

    let first = files
      .first()
      .ok_or_else(|| FrameDirectoryInputError::Empty(directory.clone()))?;
    let dimensions = ImageReader::open(first)?.into_dimensions()?;
    info!(
      "打开图片目录输入: {} ({} 帧, {}x{})",
      directory,
      files.len(),
      dimensions.0,
      dimensions.1
    );

    Ok(FrameDirectoryInput {
      files,
      cursor: 0,
      dimensions,
      index: 0,
      opened: Instant::now(),
    })
  }
}

impl VideoSource for FrameDirectoryInput {
  fn dimensions(&self) -> (u32, u32) {
    self.dimensions
  }

  fn capture(&mut self) -> Option<Frame> {
    let path = &self.files[self.cursor];
    self.cursor = (self.cursor + 1) % self.files.len();

    let image = match ImageReader::open(path).map(|r| r.decode()) {
      Ok(Ok(image)) => image.to_rgb8(),
      Ok(Err(e)) => {
        warn!("解码帧失败 {}: {}", path.display(), e);
        return None;
      }
      Err(e) => {
        warn!("读取帧失败 {}: {}", path.display(), e);
        return None;
      }
    };
    debug!("回放帧 {}", path.display());

    self.dimensions = image.dimensions();
    let frame = Frame::new(image, self.index, self.opened.elapsed().as_millis() as u64);
    self.index += 1;
    Some(frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  fn frames_url(dir: &std::path::Path) -> Url {
    Url::parse(&format!("frames://{}", dir.display())).unwrap()
  }

  #[test]
  fn cycles_frames_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::from_pixel(4, 4, Rgb([2, 0, 0]))
      .save(dir.path().join("b.png"))
      .unwrap();
    RgbImage::from_pixel(4, 4, Rgb([1, 0, 0]))
      .save(dir.path().join("a.png"))
      .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let mut input = FrameDirectoryInput::from_url(&frames_url(dir.path())).unwrap();
    assert_eq!(input.dimensions(), (4, 4));

    let reds: Vec<u8> = (0..3)
      .map(|_| input.capture().unwrap().image.get_pixel(0, 0).0[0])
      .collect();
    assert_eq!(reds, vec![1, 2, 1]);
  }

  #[test]
  fn empty_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      FrameDirectoryInput::from_url(&frames_url(dir.path())),
      Err(FrameDirectoryInputError::Empty(_))
    ));
  }
}
