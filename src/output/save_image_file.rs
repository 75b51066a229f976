// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/output/save_image_file.rs - 保存最新的合成画面
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{Render, TickOverlay},
  url_path,
};

/// 每个节拍覆盖写入同一个图像文件
pub struct SaveImageFileOutput {
  path: PathBuf,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput::new(url_path(uri)))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save_image(&self, image: &image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;
    debug!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl Render for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &Frame, overlay: &TickOverlay<'_>) -> Result<(), Self::Error> {
    let image = overlay.surface.composite(&frame.image);
    self.save_image(&image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::output::OverlaySurface;
  use crate::tally::TallyResult;
  use image::{Rgb, RgbImage, Rgba};

  #[test]
  fn writes_the_composited_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/latest.png");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), path.as_path());

    let frame = Frame::new(RgbImage::from_pixel(4, 4, Rgb([0, 0, 0])), 0, 0);
    let mut surface = OverlaySurface::new(4, 4);
    surface.canvas_mut().put_pixel(2, 2, Rgba([0, 255, 255, 255]));
    let tally = TallyResult::default();
    let overlay = TickOverlay {
      tick: 1,
      surface: &surface,
      detections: &[],
      tally: &tally,
    };

    output.render_result(&frame, &overlay).unwrap();

    let saved = image::open(&path).unwrap().to_rgb8();
    assert_eq!(saved.get_pixel(2, 2).0, [0, 255, 255]);
    assert_eq!(saved.get_pixel(0, 0).0, [0, 0, 0]);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
