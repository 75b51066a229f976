// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/input/v4l_input.rs - V4L 摄像头输入
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

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{FourCC, buffer::Type};

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, input::VideoSource, url_path};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Mjpg,
  Yuyv,
  Rgb3,
}

impl PixelFormat {
  fn from_fourcc(fourcc: FourCC) -> Option<Self> {
    match &fourcc.repr {
      b"MJPG" => Some(PixelFormat::Mjpg),
      b"YUYV" => Some(PixelFormat::Yuyv),
      b"RGB3" => Some(PixelFormat::Rgb3),
      _ => None,
    }
  }
}

const CAPTURE_BUFFERS: u32 = 4;

/// V4L2 摄像头，每个节拍抓取一帧
pub struct V4lInput {
  device: v4l::Device,
  device_path: String,
  width: u32,
  height: u32,
  format: PixelFormat,
  healthy: bool,
  index: u64,
  opened: Instant,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    // v4l:///dev/video0
    let device_path = match url_path(url) {
      path if path.is_empty() || path == "/" => "/dev/video0".to_string(),
      path => path,
    };

    let device = v4l::Device::with_path(&device_path)?;

    // 优先 MJPG，设备拒绝时沿用当前格式
    let mut format = device.format()?;
    format.fourcc = FourCC::new(b"MJPG");
    let format = device.set_format(&format).or_else(|_| device.format())?;

    let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
      V4lInputError::UnsupportedPixelFormat(format.fourcc.str().unwrap_or("????").to_string())
    })?;

    info!(
      "打开摄像头 {}: {}x{} {:?}",
      device_path, format.width, format.height, pixel_format
    );

    Ok(V4lInput {
      device,
      device_path,
      width: format.width,
      height: format.height,
      format: pixel_format,
      healthy: true,
      index: 0,
      opened: Instant::now(),
    })
  }
}

impl V4lInput {
  fn capture_image(&self) -> Result<RgbImage, V4lInputError> {
    let mut stream =
      v4l::io::mmap::Stream::with_buffers(&self.device, Type::VideoCapture, CAPTURE_BUFFERS)?;
    let (buf, _meta) = stream.next()?;

    let image = match self.format {
      PixelFormat::Mjpg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map_err(|e| V4lInputError::IoError(std::io::Error::other(e)))?
        .to_rgb8(),
      PixelFormat::Rgb3 => RgbImage::from_raw(self.width, self.height, buf.to_vec())
        .ok_or_else(|| std::io::Error::other("RGB3 缓冲区大小不匹配"))?,
      PixelFormat::Yuyv => yuyv_to_rgb(buf, self.width, self.height)
        .ok_or_else(|| std::io::Error::other("YUYV 缓冲区大小不匹配"))?,
    };
    Ok(image)
  }
}

impl VideoSource for V4lInput {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  fn is_ready(&self) -> bool {
    self.healthy && self.width > 0 && self.height > 0
  }

  fn capture(&mut self) -> Option<Frame> {
    match self.capture_image() {
      Ok(image) => {
        self.healthy = true;
        (self.width, self.height) = image.dimensions();
        let frame = Frame::new(image, self.index, self.opened.elapsed().as_millis() as u64);
        self.index += 1;
        Some(frame)
      }
      Err(e) => {
        if self.healthy {
          warn!("摄像头 {} 抓帧失败: {}", self.device_path, e);
        }
        // 下一个节拍仍会重试
        self.healthy = false;
        None
      }
    }
  }
}

fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Option<RgbImage> {
  let pixels = (width * height) as usize;
  if buf.len() < pixels * 2 {
    return None;
  }

  let mut rgb = Vec::with_capacity(pixels * 3);
  for chunk in buf[..pixels * 2].chunks_exact(4) {
    let (y0, u, y1, v) = (chunk[0] as f32, chunk[1] as f32, chunk[2] as f32, chunk[3] as f32);
    for y in [y0, y1] {
      let c = y - 16.0;
      let d = u - 128.0;
      let e = v - 128.0;
      rgb.push((1.164 * c + 1.596 * e).clamp(0.0, 255.0) as u8);
      rgb.push((1.164 * c - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8);
      rgb.push((1.164 * c + 2.017 * d).clamp(0.0, 255.0) as u8);
    }
  }
  RgbImage::from_raw(width, height, rgb)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_gray_converts_to_gray() {
    let buf = [128u8, 128, 128, 128].repeat(2);
    let image = yuyv_to_rgb(&buf, 2, 2).unwrap();
    let px = image.get_pixel(1, 1).0;
    assert!(px[0] == px[1] && px[1] == px[2]);
  }

  #[test]
  fn short_yuyv_buffer_is_rejected() {
    assert!(yuyv_to_rgb(&[0u8; 4], 2, 2).is_none());
  }
}
