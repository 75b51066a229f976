// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/model/record.rs - 回放已记录的检测结果
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

//! 记录格式与目录记录输出一致，每行一个检测：
//!
//! ```text
//! banana, 0.9100, 0.1000, 0.2000, 0.3000, 0.4000
//! ```
//!
//! 依次为类别、置信度、归一化的 x_min, y_min, x_max, y_max。
//! 类别也可以是 COCO 编号（`46, 0.9100, ...`），回放时换回类别名。
//! 单个文件中用空行分隔不同帧，单独一行 `-` 表示没有检测的帧；
//! 指向目录时递归查找 `.txt` 文件，按路径顺序每个文件作为一帧，
//! 因此可以直接回放按 `YYYY/MM/DD` 分层的归档目录。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{BoundingBox, COCO_CLASSES, Detection, Detector, DetectorBuilder, LoadError, retain_top},
  url_path,
};

#[derive(Debug, Clone, PartialEq)]
struct RecordItem {
  class: String,
  score: f32,
  bbox: [f32; 4],
}

#[derive(Error, Debug)]
pub enum RecordDetectorError {
  #[error("帧尺寸为零 ({0}x{1})，无法换算检测框")]
  EmptyFrame(u32, u32),
}

#[derive(Debug, Clone)]
pub struct RecordDetectorBuilder {
  path: PathBuf,
}

impl FromUrlWithScheme for RecordDetectorBuilder {
  const SCHEME: &'static str = "record";
}

impl FromUrl for RecordDetectorBuilder {
  type Error = LoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LoadError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(RecordDetectorBuilder {
      path: PathBuf::from(url_path(url)),
    })
  }
}

impl RecordDetectorBuilder {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

impl DetectorBuilder for RecordDetectorBuilder {
  type Detector = RecordDetector;

  fn build(self) -> Result<Self::Detector, LoadError> {
    info!("加载检测记录: {}", self.path.display());
    let frames = if self.path.is_dir() {
      read_record_directory(&self.path)?
    } else {
      parse_blocks(&std::fs::read_to_string(&self.path)?)?
    };
    debug!("检测记录共 {} 帧", frames.len());
    Ok(RecordDetector {
      frames,
      cursor: AtomicUsize::new(0),
    })
  }
}

fn collect_record_files(directory: &Path, files: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
  for entry in std::fs::read_dir(directory)? {
    let path = entry?.path();
    if path.is_dir() {
      collect_record_files(&path, files)?;
    } else if path.extension().is_some_and(|ext| ext == "txt") {
      files.push(path);
    }
  }
  Ok(())
}

fn read_record_directory(directory: &Path) -> Result<Vec<Vec<RecordItem>>, LoadError> {
  let mut files = Vec::new();
  collect_record_files(directory, &mut files)?;
  files.sort();

  files
    .iter()
    .map(|file| {
      let content = std::fs::read_to_string(file)?;
      content
        .lines()
        .enumerate()
        .filter(|(_, line)| !skip_line(line))
        .map(|(n, line)| parse_line(line, n + 1))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LoadError::InvalidModel(format!("{}: {}", file.display(), e)))
    })
    .collect()
}

fn skip_line(line: &str) -> bool {
  let line = line.trim();
  line.is_empty() || line == "-" || line.starts_with('#')
}

fn parse_blocks(content: &str) -> Result<Vec<Vec<RecordItem>>, LoadError> {
  let mut frames = Vec::new();
  let mut current = Vec::new();
  let mut open = false;

  for (n, line) in content.lines().enumerate() {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
      continue;
    }
    if trimmed.is_empty() {
      if open {
        frames.push(std::mem::take(&mut current));
        open = false;
      }
      continue;
    }
    open = true;
    if trimmed == "-" {
      continue;
    }
    current.push(parse_line(trimmed, n + 1).map_err(LoadError::InvalidModel)?);
  }
  if open {
    frames.push(current);
  }
  Ok(frames)
}

fn parse_line(line: &str, line_no: usize) -> Result<RecordItem, String> {
  let fields: Vec<&str> = line.split(',').map(str::trim).collect();
  if fields.len() != 6 {
    return Err(format!("第 {} 行字段数应为 6, 实际为 {}", line_no, fields.len()));
  }

  let number = |i: usize| {
    fields[i]
      .parse::<f32>()
      .map_err(|e| format!("第 {} 行第 {} 个字段无效: {}", line_no, i + 1, e))
  };

  Ok(RecordItem {
    class: class_name(fields[0]),
    score: number(1)?,
    bbox: [number(2)?, number(3)?, number(4)?, number(5)?],
  })
}

fn class_name(label: &str) -> String {
  label
    .parse::<usize>()
    .ok()
    .and_then(|id| COCO_CLASSES.get(id))
    .map_or_else(|| label.to_string(), |name| name.to_string())
}

/// 按帧循环返回记录中的检测结果
pub struct RecordDetector {
  frames: Vec<Vec<RecordItem>>,
  cursor: AtomicUsize,
}

impl RecordDetector {
  pub fn frame_count(&self) -> usize {
    self.frames.len()
  }
}

impl Detector for RecordDetector {
  type Error = RecordDetectorError;

  fn detect(
    &self,
    frame: &Frame,
    max_detections: usize,
    min_confidence: f32,
  ) -> Result<Vec<Detection>, Self::Error> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
      return Err(RecordDetectorError::EmptyFrame(width, height));
    }
    if self.frames.is_empty() {
      return Ok(Vec::new());
    }

    let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.frames.len();
    let detections = self.frames[index]
      .iter()
      .map(|item| {
        Detection::new(
          item.class.clone(),
          item.score,
          BoundingBox::from_normalized(item.bbox, width, height),
        )
      })
      .collect();

    Ok(retain_top(detections, max_detections, min_confidence))
  }
}
