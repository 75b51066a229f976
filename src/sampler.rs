// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/sampler.rs - 定时取帧
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

use std::future::Future;
use std::sync::{
  Arc, Mutex,
  atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{frame::Frame, input::VideoSource, output::OverlaySurface};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// 会话存活标记，停止后所有写入叠加层或输出的操作都应放弃
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
  fn new() -> Self {
    Self(Arc::new(AtomicBool::new(true)))
  }

  pub fn is_alive(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }

  fn kill(&self) {
    self.0.store(false, Ordering::Release);
  }
}

/// 一个有效节拍：源已就绪且取到了帧
pub struct Tick {
  pub index: u64,
  pub frame: Frame,
  pub alive: Liveness,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
  interval: Duration,
}

impl Default for FrameSampler {
  fn default() -> Self {
    Self::new(DEFAULT_INTERVAL)
  }
}

impl FrameSampler {
  pub fn new(interval: Duration) -> Self {
    Self { interval }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// 启动采样任务，必须在 tokio 运行时内调用
  ///
  /// 每个节拍内 `on_tick` 执行完毕后才会开始下一个节拍，
  /// 处理过慢时错过的节拍直接丢弃。源未就绪或取帧失败的节拍不调用 `on_tick`。
  pub fn start<S, F, Fut>(
    &self,
    mut source: S,
    surface: Arc<Mutex<OverlaySurface>>,
    mut on_tick: F,
  ) -> SamplerHandle
  where
    S: VideoSource,
    F: FnMut(Tick) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let alive = Liveness::new();
    let interval = self.interval;
    let task_alive = alive.clone();

    info!("启动采样器，间隔 {:?}", interval);
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      let mut index = 0u64;

      loop {
        tokio::select! {
          biased;
          _ = stop_rx.changed() => break,
          _ = ticker.tick() => {}
        }
        if !task_alive.is_alive() {
          break;
        }

        if !source.is_ready() {
          debug!("视频源未就绪，跳过节拍");
          continue;
        }
        let Some(frame) = source.capture() else {
          debug!("视频源暂不可用，跳过节拍");
          continue;
        };

        match surface.lock() {
          Ok(mut surface) => {
            if surface.sync_dimensions(frame.width(), frame.height()) {
              debug!("叠加层尺寸同步为 {}x{}", frame.width(), frame.height());
            }
          }
          Err(_) => {
            warn!("叠加层锁已中毒，停止采样");
            break;
          }
        }

        index += 1;
        let tick = Tick {
          index,
          frame,
          alive: task_alive.clone(),
        };
        tokio::select! {
          biased;
          _ = stop_rx.changed() => break,
          _ = on_tick(tick) => {}
        }
      }

      info!("采样器已停止，共 {} 个有效节拍", index);
    });

    SamplerHandle {
      stop: stop_tx,
      alive,
      task: Some(task),
    }
  }
}

/// 运行中的采样任务，丢弃时自动停止
pub struct SamplerHandle {
  stop: watch::Sender<bool>,
  alive: Liveness,
  task: Option<JoinHandle<()>>,
}

impl SamplerHandle {
  /// 停止采样，可重复调用
  pub fn stop(&self) {
    self.alive.kill();
    self.stop.send_replace(true);
  }

  pub fn is_stopped(&self) -> bool {
    !self.alive.is_alive()
  }

  pub fn liveness(&self) -> Liveness {
    self.alive.clone()
  }

  /// 停止并等待采样任务退出
  pub async fn shutdown(mut self) {
    self.stop();
    if let Some(task) = self.task.take()
      && let Err(e) = task.await
    {
      warn!("采样任务异常退出: {}", e);
    }
  }
}

impl Drop for SamplerHandle {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;
  use std::sync::atomic::AtomicUsize;

  struct FakeSource {
    width: u32,
    height: u32,
    available: bool,
    captures: Arc<AtomicUsize>,
  }

  impl FakeSource {
    fn new(width: u32, height: u32) -> (Self, Arc<AtomicUsize>) {
      let captures = Arc::new(AtomicUsize::new(0));
      (
        Self {
          width,
          height,
          available: true,
          captures: captures.clone(),
        },
        captures,
      )
    }
  }

  impl VideoSource for FakeSource {
    fn dimensions(&self) -> (u32, u32) {
      (self.width, self.height)
    }

    fn capture(&mut self) -> Option<Frame> {
      let n = self.captures.fetch_add(1, Ordering::SeqCst);
      self
        .available
        .then(|| Frame::new(RgbImage::new(self.width, self.height), n as u64, 0))
    }
  }

  fn counting_tick(counter: Arc<AtomicUsize>) -> impl FnMut(Tick) -> std::future::Ready<()> {
    move |_tick| {
      counter.fetch_add(1, Ordering::SeqCst);
      std::future::ready(())
    }
  }

  #[tokio::test]
  async fn ticks_at_interval_and_syncs_surface() {
    let (source, _) = FakeSource::new(32, 24);
    let surface = Arc::new(Mutex::new(OverlaySurface::new(0, 0)));
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = FrameSampler::new(Duration::from_millis(10)).start(
      source,
      surface.clone(),
      counting_tick(ticks.clone()),
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.shutdown().await;

    assert!(ticks.load(Ordering::SeqCst) >= 3);
    assert_eq!(surface.lock().unwrap().dimensions(), (32, 24));
  }

  #[tokio::test]
  async fn unready_source_never_ticks() {
    let (source, captures) = FakeSource::new(0, 0);
    let surface = Arc::new(Mutex::new(OverlaySurface::new(0, 0)));
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = FrameSampler::new(Duration::from_millis(10)).start(
      source,
      surface.clone(),
      counting_tick(ticks.clone()),
    );
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.shutdown().await;

    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert_eq!(captures.load(Ordering::SeqCst), 0);
    let surface = surface.lock().unwrap();
    assert_eq!(surface.dimensions(), (0, 0));
    assert!(surface.is_blank());
  }

  #[tokio::test]
  async fn unavailable_source_is_a_silent_no_op() {
    let (mut source, captures) = FakeSource::new(16, 16);
    source.available = false;
    let surface = Arc::new(Mutex::new(OverlaySurface::new(0, 0)));
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = FrameSampler::new(Duration::from_millis(10)).start(
      source,
      surface.clone(),
      counting_tick(ticks.clone()),
    );
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.shutdown().await;

    assert!(captures.load(Ordering::SeqCst) > 0);
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert_eq!(surface.lock().unwrap().dimensions(), (0, 0));
  }

  #[tokio::test]
  async fn stop_is_idempotent_and_final() {
    let (source, _) = FakeSource::new(8, 8);
    let surface = Arc::new(Mutex::new(OverlaySurface::new(0, 0)));
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = FrameSampler::new(Duration::from_millis(10)).start(
      source,
      surface,
      counting_tick(ticks.clone()),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();
    handle.stop();
    assert!(handle.is_stopped());
    handle.shutdown().await;

    let after_stop = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
  }

  #[tokio::test]
  async fn dropping_the_handle_stops_sampling() {
    let (source, _) = FakeSource::new(8, 8);
    let surface = Arc::new(Mutex::new(OverlaySurface::new(0, 0)));
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = FrameSampler::new(Duration::from_millis(10)).start(
      source,
      surface,
      counting_tick(ticks.clone()),
    );
    let alive = handle.liveness();
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(handle);
    assert!(!alive.is_alive());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_drop = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
  }

  #[tokio::test]
  async fn in_flight_tick_is_abandoned_on_stop() {
    let (source, _) = FakeSource::new(8, 8);
    let surface = Arc::new(Mutex::new(OverlaySurface::new(0, 0)));
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let (s, f) = (started.clone(), finished.clone());
    let handle = FrameSampler::new(Duration::from_millis(10)).start(
      source,
      surface,
      move |_tick| {
        let (s, f) = (s.clone(), f.clone());
        async move {
          s.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_secs(5)).await;
          f.fetch_add(1, Ordering::SeqCst);
        }
      },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    // 节拍串行执行，慢节拍期间不会开始下一个
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
  }
}
