// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/args.rs - 自助结账终端参数配置
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
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use liangcang::{
  auth::{AuthWrapper, ClientCredentials, StaticToken},
  session::SessionConfig,
  tally::{ClassLimit, ClassLimits, PantryRules, RecognizedClasses},
};

/// 粮仓自助结账终端
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  /// - 回放记录: record:///path/to/scan.txt
  /// - RKNPU YOLO26: yolo26:///path/to/model.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 视频源
  /// - 静态图片: image:///path/to/shelf.png
  /// - 图片目录: frames:///path/to/dir
  /// - 摄像头: v4l:///dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 叠加画面输出（可选）
  /// - 最新画面: image:///path/to/latest.png
  /// - 按日期归档: folder:///path/to/dir?record=name&always
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  /// 结账接口地址
  #[arg(long, env = "LIANGCANG_CHECKOUT_URL", value_name = "URL")]
  pub checkout_url: Url,

  /// 扫码获得的会话令牌
  #[arg(long, env = "LIANGCANG_SESSION_TOKEN", value_name = "TOKEN")]
  pub session_token: String,

  /// 识别类别（可重复），默认 banana, carrot, bottle, broccoli, donut
  #[arg(long = "class", value_name = "NAME")]
  pub classes: Vec<String>,

  /// 每类限额（可重复），默认 banana=1 carrot=2 bottle=1 broccoli=2 donut=2
  #[arg(long = "limit", value_name = "NAME=N")]
  pub limits: Vec<ClassLimit>,

  /// 采样间隔（毫秒）
  #[arg(long, default_value = "500", value_name = "MS")]
  pub interval_ms: u64,

  /// 每帧最多保留的检测数
  #[arg(long, default_value = "20", value_name = "COUNT")]
  pub max_detections: usize,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub min_confidence: f32,

  /// 单次检测超时（毫秒）
  #[arg(long, default_value = "2000", value_name = "MS")]
  pub detect_timeout_ms: u64,

  /// 结账请求超时（毫秒）
  #[arg(long, default_value = "10000", value_name = "MS")]
  pub submit_timeout_ms: u64,

  /// 模型加载失败时的重试次数
  #[arg(long, default_value = "3", value_name = "COUNT")]
  pub load_retries: u32,

  /// 叠加层文字使用的 TrueType 字体，默认使用内嵌字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 固定的 Bearer 令牌
  #[arg(long, env = "LIANGCANG_BEARER_TOKEN", hide_env_values = true)]
  pub bearer_token: Option<String>,

  /// OAuth2 令牌地址（客户端凭据授权）
  #[arg(long, env = "LIANGCANG_AUTH_TOKEN_URL", value_name = "URL")]
  pub auth_token_url: Option<Url>,

  #[arg(long, env = "LIANGCANG_AUTH_CLIENT_ID")]
  pub auth_client_id: Option<String>,

  #[arg(long, env = "LIANGCANG_AUTH_CLIENT_SECRET", hide_env_values = true)]
  pub auth_client_secret: Option<String>,

  #[arg(long, env = "LIANGCANG_AUTH_AUDIENCE")]
  pub auth_audience: Option<String>,
}

impl Args {
  pub fn rules(&self) -> PantryRules {
    let recognized = if self.classes.is_empty() {
      RecognizedClasses::default()
    } else {
      RecognizedClasses::new(&self.classes)
    };
    let limits = if self.limits.is_empty() {
      ClassLimits::default()
    } else {
      ClassLimits::new(self.limits.iter().cloned())
    };
    PantryRules::new(recognized, limits)
  }

  pub fn session_config(&self) -> SessionConfig {
    SessionConfig {
      interval: Duration::from_millis(self.interval_ms),
      max_detections: self.max_detections,
      min_confidence: self.min_confidence,
      detect_timeout: Duration::from_millis(self.detect_timeout_ms),
    }
  }

  pub fn submit_timeout(&self) -> Duration {
    Duration::from_millis(self.submit_timeout_ms)
  }

  pub fn auth(&self) -> Result<AuthWrapper> {
    if let Some(token_url) = &self.auth_token_url {
      let (Some(client_id), Some(client_secret)) = (&self.auth_client_id, &self.auth_client_secret)
      else {
        bail!("使用 --auth-token-url 时必须同时提供 --auth-client-id 与 --auth-client-secret");
      };
      let client = reqwest::Client::builder()
        .timeout(self.submit_timeout())
        .build()?;
      return Ok(AuthWrapper::ClientCredentials(Box::new(
        ClientCredentials::new(
          client,
          token_url.clone(),
          client_id.clone(),
          client_secret.clone(),
          self.auth_audience.clone(),
        ),
      )));
    }

    match &self.bearer_token {
      Some(token) => Ok(AuthWrapper::Static(StaticToken::new(token.clone()))),
      None => bail!("需要 --bearer-token 或 --auth-token-url 之一"),
    }
  }
}
