// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/main.rs - 自助结账终端
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

mod args;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use liangcang::{
  FromUrl,
  checkout::CheckoutSubmitter,
  input::InputWrapper,
  model::{DetectorWrapperBuilder, load_detector_with_retries},
  output::{OutputWrapper, draw::Draw},
  session::CheckoutSession,
};

const LOAD_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum KioskEvent {
  Submit,
  Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型: {}", args.model);
  info!("视频源: {}", args.input);
  info!("结账接口: {}", args.checkout_url);

  let rules = args.rules();
  let auth = args.auth()?;
  let submitter = CheckoutSubmitter::new(args.checkout_url.clone(), args.submit_timeout())?;
  let draw = match &args.font {
    Some(font) => Draw::with_font_file(font)?,
    None => Draw::default(),
  };
  let output = args
    .output
    .as_ref()
    .map(OutputWrapper::from_url)
    .transpose()?;
  let source = InputWrapper::from_url(&args.input)?;

  let builder = DetectorWrapperBuilder::from_url(&args.model)?;
  let detector = load_detector_with_retries(builder, args.load_retries, LOAD_BACKOFF).await?;

  let session = CheckoutSession::start(
    args.session_token.clone(),
    detector,
    source,
    rules,
    draw,
    output,
    args.session_config(),
  );

  let (tx, mut events) = mpsc::unbounded_channel();
  let ctrlc_tx = tx.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = ctrlc_tx.send(KioskEvent::Quit);
  })?;

  // 标准输入读取会阻塞，放在独立线程中，退出时不等待它
  std::thread::spawn(move || {
    for line in std::io::stdin().lines() {
      let event = match line {
        Ok(line) if line.trim().eq_ignore_ascii_case("q") => KioskEvent::Quit,
        Ok(_) => KioskEvent::Submit,
        Err(_) => break,
      };
      if tx.send(event).is_err() {
        return;
      }
    }
    let _ = tx.send(KioskEvent::Quit);
  });

  println!("将物品放在摄像头前，回车结账，输入 q 退出");

  let mut updates = session.subscribe();
  let mut watching = true;
  let mut shown = None;
  let event = loop {
    tokio::select! {
      event = events.recv() => break event.unwrap_or(KioskEvent::Quit),
      changed = updates.changed(), if watching => {
        if changed.is_err() {
          watching = false;
          continue;
        }
        let tally = updates.borrow_and_update().as_ref().map(|r| r.tally.clone());
        if let Some(tally) = tally
          && shown.as_ref() != Some(&tally)
        {
          println!("当前物品: {}", tally);
          for class in tally.exceeded_classes() {
            println!("  ! {} 超出限额", class);
          }
          shown = Some(tally);
        }
      }
    }
  };

  match event {
    KioskEvent::Submit => match session.checkout(&submitter, &auth).await {
      Ok(receipt) => {
        println!("结账成功: {}", receipt.body);
        Ok(())
      }
      Err(e) => {
        error!("结账失败: {}", e);
        eprintln!("结账失败，请联系工作人员: {}", e);
        Err(e.into())
      }
    },
    KioskEvent::Quit => {
      session.end().await;
      info!("已退出，未提交结账");
      Ok(())
    }
  }
}
