// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧检测计数
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

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::info;
use url::Url;

use liangcang::{
  FromUrl,
  input::{InputWrapper, VideoSource},
  model::{Detector, DetectorWrapperBuilder, load_detector},
  output::{OverlaySurface, draw::Draw},
  tally::{ClassLimit, ClassLimits, PantryRules, RecognizedClasses},
};

/// 对单帧执行 检测 → 过滤 → 计数，输出计数 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 叠加画面保存路径
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,
  #[arg(long = "class", value_name = "NAME")]
  pub classes: Vec<String>,
  #[arg(long = "limit", value_name = "NAME=N")]
  pub limits: Vec<ClassLimit>,
  #[arg(long, default_value = "20")]
  pub max_detections: usize,
  #[arg(long, default_value = "0.5")]
  pub min_confidence: f32,
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);

  let rules = PantryRules::new(
    if args.classes.is_empty() {
      RecognizedClasses::default()
    } else {
      RecognizedClasses::new(&args.classes)
    },
    if args.limits.is_empty() {
      ClassLimits::default()
    } else {
      ClassLimits::new(args.limits.iter().cloned())
    },
  );

  let mut source = InputWrapper::from_url(&args.input)?;
  let detector = load_detector(DetectorWrapperBuilder::from_url(&args.model)?).await?;

  if !source.is_ready() {
    return Err(anyhow!("输入源未就绪"));
  }
  let frame = source.capture().ok_or_else(|| anyhow!("没有输入帧"))?;

  let now = std::time::Instant::now();
  let raw = detector.detect(&frame, args.max_detections, args.min_confidence)?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  let (detections, tally) = rules.apply(&raw);
  println!("{}", serde_json::to_string_pretty(&tally.to_json())?);

  if let Some(path) = &args.output {
    let draw = match &args.font {
      Some(font) => Draw::with_font_file(font)?,
      None => Draw::default(),
    };
    let mut surface = OverlaySurface::new(frame.width(), frame.height());
    draw.render(&detections, &tally, &mut surface);
    surface.composite(&frame.image).save(path)?;
    info!("保存叠加画面: {}", path.display());
  }

  Ok(())
}
