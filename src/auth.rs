// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/auth.rs - 结账凭据获取
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
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// 令牌在过期前这么久就重新获取
const REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AuthError {
  #[error("未配置访问令牌")]
  MissingToken,
  #[error("令牌请求失败: {0}")]
  Request(#[from] reqwest::Error),
  #[error("令牌服务拒绝请求 ({status}): {body}")]
  Rejected { status: u16, body: String },
  #[error("令牌响应无效: {0}")]
  InvalidResponse(String),
}

/// 外部身份服务，提供结账请求使用的 Bearer 令牌
pub trait AccessTokenProvider: Send + Sync {
  fn access_token(&self) -> impl Future<Output = Result<String, AuthError>> + Send;
}

/// 固定令牌
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }
}

impl AccessTokenProvider for StaticToken {
  async fn access_token(&self) -> Result<String, AuthError> {
    if self.0.trim().is_empty() {
      return Err(AuthError::MissingToken);
    }
    Ok(self.0.clone())
  }
}

struct CachedToken {
  token: String,
  refresh_at: Instant,
}

/// OAuth2 客户端凭据授权，令牌缓存到过期前
pub struct ClientCredentials {
  client: reqwest::Client,
  token_url: Url,
  client_id: String,
  client_secret: String,
  audience: Option<String>,
  cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentials {
  pub fn new(
    client: reqwest::Client,
    token_url: Url,
    client_id: impl Into<String>,
    client_secret: impl Into<String>,
    audience: Option<String>,
  ) -> Self {
    Self {
      client,
      token_url,
      client_id: client_id.into(),
      client_secret: client_secret.into(),
      audience,
      cached: Mutex::new(None),
    }
  }

  async fn request_token(&self) -> Result<CachedToken, AuthError> {
    let mut form = vec![
      ("grant_type", "client_credentials"),
      ("client_id", self.client_id.as_str()),
      ("client_secret", self.client_secret.as_str()),
    ];
    if let Some(audience) = &self.audience {
      form.push(("audience", audience.as_str()));
    }

    let response = self
      .client
      .post(self.token_url.clone())
      .form(&form)
      .send()
      .await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(AuthError::Rejected {
        status: status.as_u16(),
        body,
      });
    }

    let body: Value = response.json().await?;
    let token = body
      .get("access_token")
      .and_then(Value::as_str)
      .filter(|t| !t.is_empty())
      .ok_or_else(|| AuthError::InvalidResponse("缺少 access_token".to_string()))?
      .to_string();
    let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(0);

    info!("获取访问令牌成功，有效期 {} 秒", expires_in);
    Ok(CachedToken {
      token,
      refresh_at: Instant::now() + Duration::from_secs(expires_in).saturating_sub(REFRESH_MARGIN),
    })
  }
}

impl AccessTokenProvider for ClientCredentials {
  async fn access_token(&self) -> Result<String, AuthError> {
    let mut cached = self.cached.lock().await;
    if let Some(token) = cached.as_ref()
      && Instant::now() < token.refresh_at
    {
      debug!("使用缓存的访问令牌");
      return Ok(token.token.clone());
    }

    let token = self.request_token().await?;
    let value = token.token.clone();
    *cached = Some(token);
    Ok(value)
  }
}

pub enum AuthWrapper {
  Static(StaticToken),
  ClientCredentials(Box<ClientCredentials>),
}

impl AccessTokenProvider for AuthWrapper {
  async fn access_token(&self) -> Result<String, AuthError> {
    match self {
      AuthWrapper::Static(provider) => provider.access_token().await,
      AuthWrapper::ClientCredentials(provider) => provider.access_token().await,
    }
  }
}
