// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/session.rs - 结账会话
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

//! 一次结账会话独占视频源、检测器和叠加层。
//!
//! 每个节拍依次执行 检测 → 过滤 → 计数 → 绘制 → 输出，
//! 最新结果通过 [`CheckoutSession::latest`] 读取，结账时提交。

use std::sync::{
  Arc, Mutex, TryLockError,
  atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
  auth::AccessTokenProvider,
  checkout::{CheckoutSubmitter, Receipt, SubmitError},
  frame::Frame,
  input::VideoSource,
  model::{Detection, Detector, retain_top},
  output::{OverlaySurface, Render, TickOverlay, draw::Draw},
  sampler::{DEFAULT_INTERVAL, FrameSampler, Liveness, SamplerHandle, Tick},
  tally::{PantryRules, TallyResult},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
  pub interval: Duration,
  pub max_detections: usize,
  pub min_confidence: f32,
  pub detect_timeout: Duration,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_INTERVAL,
      max_detections: 20,
      min_confidence: 0.5,
      detect_timeout: Duration::from_secs(2),
    }
  }
}

/// 单个节拍的失败，只记录日志，会话继续
#[derive(Error, Debug)]
pub enum DetectionTickError {
  #[error("检测失败: {0}")]
  Detect(BoxError),
  #[error("检测超时 ({0:?})")]
  Timeout(Duration),
  #[error("检测器仍在处理上一帧")]
  Busy,
  #[error("会话已结束")]
  Cancelled,
  #[error("锁已中毒")]
  Poisoned,
  #[error("检测任务异常退出: {0}")]
  Join(String),
  #[error("输出失败: {0}")]
  Output(BoxError),
}

impl DetectionTickError {
  /// 跳过的节拍不算失败
  pub fn is_skip(&self) -> bool {
    matches!(self, DetectionTickError::Busy | DetectionTickError::Cancelled)
  }
}

/// 最近一个完成节拍的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
  pub tick: u64,
  pub detections: Vec<Detection>,
  pub tally: TallyResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
  pub completed: u64,
  pub skipped: u64,
  pub failed: u64,
}

#[derive(Default)]
struct TickCounters {
  completed: AtomicU64,
  skipped: AtomicU64,
  failed: AtomicU64,
}

impl TickCounters {
  fn snapshot(&self) -> TickStats {
    TickStats {
      completed: self.completed.load(Ordering::Relaxed),
      skipped: self.skipped.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
    }
  }
}

/// 在阻塞线程池中调用检测器，同一时刻最多一次调用
///
/// 超时后阻塞调用仍在运行并持有检测器锁，之后的节拍在它结束前都会被跳过。
pub async fn detect_gated<D: Detector>(
  detector: &Arc<Mutex<D>>,
  frame: Arc<Frame>,
  config: &SessionConfig,
) -> Result<Vec<Detection>, DetectionTickError> {
  let detector = detector.clone();
  let (max_detections, min_confidence) = (config.max_detections, config.min_confidence);

  let task = tokio::task::spawn_blocking(move || {
    let detector = match detector.try_lock() {
      Ok(detector) => detector,
      Err(TryLockError::WouldBlock) => return Err(DetectionTickError::Busy),
      Err(TryLockError::Poisoned(_)) => return Err(DetectionTickError::Poisoned),
    };
    detector
      .detect(&frame, max_detections, min_confidence)
      .map_err(|e| DetectionTickError::Detect(Box::new(e)))
  });

  match tokio::time::timeout(config.detect_timeout, task).await {
    Err(_) => Err(DetectionTickError::Timeout(config.detect_timeout)),
    Ok(Err(e)) => Err(DetectionTickError::Join(e.to_string())),
    Ok(Ok(result)) => result.map(|d| retain_top(d, max_detections, min_confidence)),
  }
}

struct TickPipeline<D, O> {
  detector: Arc<Mutex<D>>,
  rules: PantryRules,
  draw: Draw,
  output: Arc<O>,
  surface: Arc<Mutex<OverlaySurface>>,
  latest: watch::Sender<Option<TickReport>>,
  counters: Arc<TickCounters>,
  config: SessionConfig,
}

impl<D: Detector, O: Render> TickPipeline<D, O> {
  async fn process(&self, tick: Tick) {
    let index = tick.index;
    match self.run(tick).await {
      Ok(()) => {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
      }
      Err(e) if e.is_skip() => {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        debug!("跳过节拍 {}: {}", index, e);
      }
      Err(e) => {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!("节拍 {} 处理失败: {}", index, e);
      }
    }
  }

  async fn run(&self, tick: Tick) -> Result<(), DetectionTickError> {
    let frame = Arc::new(tick.frame);
    let raw = detect_gated(&self.detector, frame.clone(), &self.config).await?;
    let (detections, tally) = self.rules.apply(&raw);

    // 只在绘制期间持有叠加层锁，输出使用快照
    let snapshot = {
      let mut surface = self
        .surface
        .lock()
        .map_err(|_| DetectionTickError::Poisoned)?;
      if !tick.alive.is_alive() {
        return Err(DetectionTickError::Cancelled);
      }
      self.draw.render(&detections, &tally, &mut surface);
      surface.clone()
    };
    debug!("节拍 {}: {}", tick.index, tally);

    let report = TickReport {
      tick: tick.index,
      detections,
      tally,
    };
    let output = self
      .write_output(tick.index, frame, snapshot, report.clone(), tick.alive)
      .await;
    if matches!(output, Err(DetectionTickError::Cancelled)) {
      return output;
    }

    self.latest.send_replace(Some(report));
    output
  }

  /// 图像编码和磁盘写入放到阻塞线程池
  async fn write_output(
    &self,
    index: u64,
    frame: Arc<Frame>,
    surface: OverlaySurface,
    report: TickReport,
    alive: Liveness,
  ) -> Result<(), DetectionTickError> {
    let output = self.output.clone();
    let task = tokio::task::spawn_blocking(move || {
      if !alive.is_alive() {
        return Err(DetectionTickError::Cancelled);
      }
      let overlay = TickOverlay {
        tick: index,
        surface: &surface,
        detections: &report.detections,
        tally: &report.tally,
      };
      output
        .render_result(&frame, &overlay)
        .map_err(|e| DetectionTickError::Output(Box::new(e)))
    });
    task
      .await
      .map_err(|e| DetectionTickError::Join(e.to_string()))?
  }
}

/// 进行中的结账会话
///
/// 构造即开始采样；[`CheckoutSession::checkout`] 或 [`CheckoutSession::end`]
/// 消耗会话并停止采样，直接丢弃会话同样会停止采样。
pub struct CheckoutSession {
  session_token: String,
  sampler: SamplerHandle,
  latest: watch::Receiver<Option<TickReport>>,
  counters: Arc<TickCounters>,
  surface: Arc<Mutex<OverlaySurface>>,
}

impl CheckoutSession {
  /// 必须在 tokio 运行时内调用
  pub fn start<D, S, O>(
    session_token: impl Into<String>,
    detector: D,
    source: S,
    rules: PantryRules,
    draw: Draw,
    output: O,
    config: SessionConfig,
  ) -> Self
  where
    D: Detector,
    S: VideoSource,
    O: Render,
  {
    let session_token = session_token.into();
    let (width, height) = source.dimensions();
    let surface = Arc::new(Mutex::new(OverlaySurface::new(width, height)));
    let counters = Arc::new(TickCounters::default());
    let (latest_tx, latest_rx) = watch::channel(None);

    let pipeline = Arc::new(TickPipeline {
      detector: Arc::new(Mutex::new(detector)),
      rules,
      draw,
      output: Arc::new(output),
      surface: surface.clone(),
      latest: latest_tx,
      counters: counters.clone(),
      config,
    });

    info!("开始结账会话: {}", session_token);
    let sampler = FrameSampler::new(config.interval).start(source, surface.clone(), move |tick| {
      let pipeline = pipeline.clone();
      async move { pipeline.process(tick).await }
    });

    Self {
      session_token,
      sampler,
      latest: latest_rx,
      counters,
      surface,
    }
  }

  pub fn session_token(&self) -> &str {
    &self.session_token
  }

  pub fn latest(&self) -> Option<TickReport> {
    self.latest.borrow().clone()
  }

  /// 订阅每个完成节拍的结果
  pub fn subscribe(&self) -> watch::Receiver<Option<TickReport>> {
    self.latest.clone()
  }

  pub fn surface(&self) -> Arc<Mutex<OverlaySurface>> {
    self.surface.clone()
  }

  pub fn stats(&self) -> TickStats {
    self.counters.snapshot()
  }

  /// 停止采样后提交最近一次计数，只发出一次请求
  pub async fn checkout<A: AccessTokenProvider>(
    self,
    submitter: &CheckoutSubmitter,
    auth: &A,
  ) -> Result<Receipt, SubmitError> {
    let CheckoutSession {
      session_token,
      sampler,
      latest,
      counters,
      ..
    } = self;
    sampler.shutdown().await;

    let tally = latest
      .borrow()
      .as_ref()
      .map(|report| report.tally.clone())
      .unwrap_or_default();
    let stats = counters.snapshot();
    info!(
      "会话 {} 结束采样 (完成 {}, 跳过 {}, 失败 {})",
      session_token, stats.completed, stats.skipped, stats.failed
    );

    submitter.submit(auth, &session_token, &tally).await
  }

  /// 不提交直接结束会话
  pub async fn end(self) {
    info!("结束结账会话: {}", self.session_token);
    self.sampler.shutdown().await;
  }
}
