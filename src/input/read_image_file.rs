// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::time::Instant;

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, input::VideoSource, url_path};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 静态图片输入：每个节拍都返回同一张图片
pub struct ImageFileInput {
  image: RgbImage,
  index: u64,
  opened: Instant,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = url_path(url);
    let image = ImageReader::open(&path)?.decode()?.to_rgb8();
    info!(
      "打开图片输入: {} ({}x{})",
      path,
      image.width(),
      image.height()
    );

    Ok(ImageFileInput::from_image(image))
  }
}

impl ImageFileInput {
  pub fn from_image(image: RgbImage) -> Self {
    Self {
      image,
      index: 0,
      opened: Instant::now(),
    }
  }
}

impl VideoSource for ImageFileInput {
  fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  fn capture(&mut self) -> Option<Frame> {
    let frame = Frame::new(
      self.image.clone(),
      self.index,
      self.opened.elapsed().as_millis() as u64,
    );
    self.index += 1;
    Some(frame)
  }
}
