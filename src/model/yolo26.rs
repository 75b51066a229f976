// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/model/yolo26.rs - RKNPU 上的 YOLO26 检测器
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

use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, resize_nhwc},
  model::{
    BoundingBox, COCO_CLASSES, Detection, Detector, DetectorBuilder, LoadError, retain_top,
  },
  url_path,
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = COCO_CLASSES.len();
const YOLO26_INPUT_W: f32 = 640.0;
const YOLO26_INPUT_H: f32 = 640.0;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

pub struct Yolo26 {
  context: Context,
}

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
}

#[derive(Debug, Clone)]
pub struct Yolo26Builder {
  model_path: String,
}

impl FromUrlWithScheme for Yolo26Builder {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26Builder {
  type Error = LoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LoadError::SchemeMismatch(format!(
        "模型路径必须使用 {} 方案, 实际为 {}",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(Yolo26Builder {
      model_path: url_path(url),
    })
  }
}

fn invalid(msg: &str, e: rknpu::Error) -> LoadError {
  LoadError::InvalidModel(format!("{}: {}", msg, e))
}

impl DetectorBuilder for Yolo26Builder {
  type Detector = Yolo26;

  fn build(self) -> Result<Yolo26, LoadError> {
    info!("加载模型文件: {}", self.model_path);
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context =
      Context::new(&mode_data, InitFlags::default()).map_err(|e| invalid("无法创建上下文", e))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      error!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      return Err(LoadError::InvalidModel(format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      )));
    }

    Ok(Yolo26 { context })
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (reg, cls) 元组，如果大小不匹配则返回 None
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl Yolo26 {
  /// 解码三个检测头，返回归一化坐标下的 (class_id, score, bbox)
  fn postprocess(output: &rknpu::Output, min_confidence: f32) -> Vec<(usize, f32, [f32; 4])> {
    let mut items = Vec::new();

    for (head_idx, (&(map_h, map_w), stride)) in
      YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
    {
      let spatial = map_h * map_w;
      let reg_expected = 4 * spatial;
      let cls_expected = YOLO26_CLASS_NUM * spatial;

      // RKNN 输出顺序可能不同，按张量大小区分回归与分类
      let (output_idx1, output_idx2) = (head_idx * 2, head_idx * 2 + 1);
      let (tensor1, tensor2) = match (output.get_f32(output_idx1), output.get_f32(output_idx2)) {
        (Ok(t1), Ok(t2)) => (t1, t2),
        (Err(e), _) | (_, Err(e)) => {
          error!("获取检测头 {} 输出失败: {}", head_idx, e);
          continue;
        }
      };

      let Some((reg, cls)) = match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected)
      else {
        error!(
          "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}",
          head_idx,
          tensor1.len(),
          tensor2.len()
        );
        continue;
      };

      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let (score, class_id) = {
            let mut max_logit = f32::MIN;
            let mut cls_idx = 0usize;
            for c in 0..YOLO26_CLASS_NUM {
              let logit = cls[c * spatial + idx];
              if logit > max_logit {
                max_logit = logit;
                cls_idx = c;
              }
            }
            (sigmoid(max_logit), cls_idx)
          };

          if score < min_confidence {
            continue;
          }

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;

          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);

          items.push((
            class_id,
            score,
            [
              xmin / YOLO26_INPUT_W,
              ymin / YOLO26_INPUT_H,
              xmax / YOLO26_INPUT_W,
              ymax / YOLO26_INPUT_H,
            ],
          ));
        }
      }
    }

    items
  }
}

impl Detector for Yolo26 {
  type Error = Yolo26Error;

  fn detect(
    &self,
    frame: &Frame,
    max_detections: usize,
    min_confidence: f32,
  ) -> Result<Vec<Detection>, Self::Error> {
    let input = resize_nhwc(frame, YOLO26_INPUT_W as u32, YOLO26_INPUT_H as u32);

    debug!("设置模型输入");
    self
      .context
      .set_input(0, &input, rknpu::TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let (width, height) = frame.dimensions();
    let detections = Self::postprocess(&output, min_confidence)
      .into_iter()
      .map(|(class_id, score, bbox)| {
        Detection::new(
          COCO_CLASSES[class_id],
          score,
          BoundingBox::from_normalized(bbox, width, height),
        )
      })
      .collect();

    Ok(retain_top(detections, max_detections, min_confidence))
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn swapped_head_outputs_are_matched_by_size() {
    let reg = vec![0.0f32; 8];
    let cls = vec![0.0f32; 20];
    let (r, c) = match_reg_cls_tensors(&cls, &reg, 8, 20).unwrap();
    assert_eq!((r.len(), c.len()), (8, 20));
    assert!(match_reg_cls_tensors(&reg, &reg, 8, 20).is_none());
  }

  #[test]
  fn sigmoid_is_centered() {
    assert_eq!(sigmoid(0.0), 0.5);
  }
}
