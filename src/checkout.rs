// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/checkout.rs - 结账提交
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

use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::auth::{AccessTokenProvider, AuthError};
use crate::tally::TallyResult;

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CheckoutError {
  #[error("结账接口返回 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("结账请求超时")]
  Timeout,
  #[error("网络错误: {0}")]
  Network(#[source] reqwest::Error),
  #[error("结账回执无效: {0}")]
  InvalidReceipt(String),
}

impl From<reqwest::Error> for CheckoutError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      CheckoutError::Timeout
    } else {
      CheckoutError::Network(e)
    }
  }
}

#[derive(Error, Debug)]
pub enum SubmitError {
  #[error("身份认证失败: {0}")]
  Auth(#[from] AuthError),
  #[error("结账失败: {0}")]
  Checkout(#[from] CheckoutError),
}

/// 结账接口返回的回执
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
  pub status: u16,
  pub body: Value,
}

/// 请求体：`items` 为逗号分隔的类别名，`tally` 为结构化计数
pub fn request_body(session_token: &str, tally: &TallyResult) -> Value {
  json!({
    "token": session_token,
    "items": tally.items_summary(),
    "tally": tally.to_json(),
  })
}

/// 每次调用只发出一次请求，不重试
#[derive(Debug, Clone)]
pub struct CheckoutSubmitter {
  client: reqwest::Client,
  endpoint: Url,
}

impl CheckoutSubmitter {
  pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, CheckoutError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(CheckoutError::Network)?;
    Ok(Self { client, endpoint })
  }

  pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
    Self { client, endpoint }
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  pub async fn submit<A: AccessTokenProvider>(
    &self,
    auth: &A,
    session_token: &str,
    tally: &TallyResult,
  ) -> Result<Receipt, SubmitError> {
    let bearer = auth.access_token().await?;
    let body = request_body(session_token, tally);

    info!("提交结账: {} -> {}", tally, self.endpoint);
    let response = self
      .client
      .post(self.endpoint.clone())
      .bearer_auth(bearer)
      .json(&body)
      .send()
      .await
      .map_err(CheckoutError::from)?;

    let status = response.status();
    let text = response.text().await.map_err(CheckoutError::from)?;
    if !status.is_success() {
      error!("结账接口返回错误状态 {}", status);
      return Err(
        CheckoutError::Status {
          status: status.as_u16(),
          body: text,
        }
        .into(),
      );
    }

    let body = if text.trim().is_empty() {
      Value::Null
    } else {
      serde_json::from_str(&text).map_err(|e| CheckoutError::InvalidReceipt(e.to_string()))?
    };
    info!("结账完成 ({})", status);
    Ok(Receipt {
      status: status.as_u16(),
      body,
    })
  }
}
