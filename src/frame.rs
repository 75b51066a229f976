// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/frame.rs - 视频帧定义
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

use image::RgbImage;

/// 帧数据
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒，自输入源打开起）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }
}

/// 按 NHWC 排布重采样为模型输入
pub fn resize_nhwc(frame: &Frame, width: u32, height: u32) -> Vec<u8> {
  if frame.dimensions() == (width, height) {
    return frame.image.as_raw().clone();
  }
  image::imageops::resize(
    &frame.image,
    width,
    height,
    image::imageops::FilterType::Triangle,
  )
  .into_raw()
}
