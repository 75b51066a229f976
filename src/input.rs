// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use crate::{FromUrl, frame::Frame};

/// 实时视频源
///
/// 采样器每个节拍调用一次 [`VideoSource::capture`]。
/// 源未就绪时节拍直接跳过，不视为错误。
pub trait VideoSource: Send + 'static {
  /// 当前帧尺寸，未知时为 (0, 0)
  fn dimensions(&self) -> (u32, u32);

  /// 元数据已加载且尺寸非零
  fn is_ready(&self) -> bool {
    let (w, h) = self.dimensions();
    w > 0 && h > 0
  }

  /// 取当前帧；`None` 表示源暂时不可用
  fn capture(&mut self) -> Option<Frame>;
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
  fn dimensions(&self) -> (u32, u32) {
    (**self).dimensions()
  }

  fn is_ready(&self) -> bool {
    (**self).is_ready()
  }

  fn capture(&mut self) -> Option<Frame> {
    (**self).capture()
  }
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "frame_directory")]
mod frame_directory;
#[cfg(feature = "frame_directory")]
pub use self::frame_directory::{FrameDirectoryInput, FrameDirectoryInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "frame_directory")]
  #[error("Frame directory input error: {0}")]
  FrameDirectoryInputError(#[from] FrameDirectoryInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "frame_directory")]
  FrameDirectory(FrameDirectoryInput),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "frame_directory")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == FrameDirectoryInput::SCHEME {
        let input = FrameDirectoryInput::from_url(url)?;
        return Ok(InputWrapper::FrameDirectory(input));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lInput::SCHEME {
        let input = V4lInput::from_url(url)?;
        return Ok(InputWrapper::V4l(input));
      }
    }
    let _ = url;
    Err(InputError::SchemeMismatch)
  }
}

impl VideoSource for InputWrapper {
  fn dimensions(&self) -> (u32, u32) {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.dimensions(),
      #[cfg(feature = "frame_directory")]
      InputWrapper::FrameDirectory(input) => input.dimensions(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.dimensions(),
      #[allow(unreachable_patterns)]
      _ => (0, 0),
    }
  }

  fn is_ready(&self) -> bool {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.is_ready(),
      #[cfg(feature = "frame_directory")]
      InputWrapper::FrameDirectory(input) => input.is_ready(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.is_ready(),
      #[allow(unreachable_patterns)]
      _ => false,
    }
  }

  fn capture(&mut self) -> Option<Frame> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.capture(),
      #[cfg(feature = "frame_directory")]
      InputWrapper::FrameDirectory(input) => input.capture(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.capture(),
      #[allow(unreachable_patterns)]
      _ => None,
    }
  }
}
