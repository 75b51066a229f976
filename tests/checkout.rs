// 该文件是 Liangcang （粮仓） 项目的一部分。
// tests/checkout.rs - 结账提交与会话集成测试
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

use std::sync::{
  Arc, Mutex,
  atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use axum::{
  Json, Router,
  extract::State,
  http::{HeaderMap, StatusCode, header::AUTHORIZATION},
  routing::post,
};
use image::RgbImage;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

use liangcang::{
  auth::{AuthError, ClientCredentials, StaticToken},
  checkout::{CheckoutError, CheckoutSubmitter, SubmitError},
  input::ImageFileInput,
  model::{BoundingBox, Detection, RecordDetectorBuilder, load_detector},
  output::draw::Draw,
  session::{CheckoutSession, SessionConfig},
  tally::{ClassLimits, PantryRules, aggregate},
};

#[derive(Clone, Default)]
struct Recorded {
  checkouts: Arc<Mutex<Vec<(Option<String>, Value)>>>,
  token_requests: Arc<AtomicUsize>,
}

impl Recorded {
  fn checkouts(&self) -> Vec<(Option<String>, Value)> {
    self.checkouts.lock().unwrap().clone()
  }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
  headers
    .get(AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
}

async fn checkout_ok(
  State(recorded): State<Recorded>,
  headers: HeaderMap,
  Json(body): Json<Value>,
) -> Json<Value> {
  let items = body["items"].clone();
  recorded.checkouts.lock().unwrap().push((bearer(&headers), body));
  Json(json!({ "receipt": "r-1", "items": items }))
}

async fn checkout_down(
  State(recorded): State<Recorded>,
  headers: HeaderMap,
  Json(body): Json<Value>,
) -> (StatusCode, &'static str) {
  recorded.checkouts.lock().unwrap().push((bearer(&headers), body));
  (StatusCode::INTERNAL_SERVER_ERROR, "inventory offline")
}

async fn checkout_text() -> &'static str {
  "thanks!"
}

async fn checkout_stall() -> &'static str {
  tokio::time::sleep(Duration::from_secs(5)).await;
  "{}"
}

async fn token(State(recorded): State<Recorded>, body: String) -> (StatusCode, Json<Value>) {
  recorded.token_requests.fetch_add(1, Ordering::SeqCst);
  if !body.contains("grant_type=client_credentials") || !body.contains("client_secret=s3cret") {
    return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_client" })));
  }
  (
    StatusCode::OK,
    Json(json!({ "access_token": "cc-token", "expires_in": 3600, "token_type": "Bearer" })),
  )
}

async fn serve(recorded: Recorded) -> Url {
  let app = Router::new()
    .route("/api/checkout/", post(checkout_ok))
    .route("/api/down/", post(checkout_down))
    .route("/api/text/", post(checkout_text))
    .route("/api/stall/", post(checkout_stall))
    .route("/oauth/token", post(token))
    .with_state(recorded);

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });
  Url::parse(&format!("http://{address}/")).unwrap()
}

fn submitter(base: &Url, path: &str) -> CheckoutSubmitter {
  CheckoutSubmitter::new(base.join(path).unwrap(), Duration::from_secs(2)).unwrap()
}

fn two_bananas() -> liangcang::tally::TallyResult {
  let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
  let detections = vec![
    Detection::new("banana", 0.9, bbox),
    Detection::new("banana", 0.9, bbox),
  ];
  aggregate(&detections, &ClassLimits::default())
}

#[tokio::test]
async fn submit_posts_bearer_and_exceeded_items() {
  let recorded = Recorded::default();
  let base = serve(recorded.clone()).await;

  let receipt = submitter(&base, "api/checkout/")
    .submit(&StaticToken::new("kiosk-token"), "scan-7", &two_bananas())
    .await
    .unwrap();

  assert_eq!(receipt.status, 200);
  assert_eq!(receipt.body["receipt"], "r-1");

  let checkouts = recorded.checkouts();
  assert_eq!(checkouts.len(), 1);
  let (auth, body) = &checkouts[0];
  assert_eq!(auth.as_deref(), Some("Bearer kiosk-token"));
  assert_eq!(body["token"], "scan-7");
  assert_eq!(body["items"], "banana, banana");
  assert_eq!(body["tally"]["banana"]["count"], 2);
  assert_eq!(body["tally"]["banana"]["exceeded"], true);
}

#[tokio::test]
async fn server_error_is_a_checkout_error() {
  let recorded = Recorded::default();
  let base = serve(recorded.clone()).await;

  let result = submitter(&base, "api/down/")
    .submit(&StaticToken::new("kiosk-token"), "scan-8", &two_bananas())
    .await;

  match result {
    Err(SubmitError::Checkout(CheckoutError::Status { status, body })) => {
      assert_eq!(status, 500);
      assert_eq!(body, "inventory offline");
    }
    other => panic!("unexpected result: {other:?}"),
  }
  // 不自动重试
  assert_eq!(recorded.checkouts().len(), 1);
}

#[tokio::test]
async fn non_json_receipt_is_rejected() {
  let base = serve(Recorded::default()).await;
  let result = submitter(&base, "api/text/")
    .submit(&StaticToken::new("kiosk-token"), "scan-9", &two_bananas())
    .await;
  assert!(matches!(
    result,
    Err(SubmitError::Checkout(CheckoutError::InvalidReceipt(_)))
  ));
}

#[tokio::test]
async fn stalled_endpoint_times_out() {
  let base = serve(Recorded::default()).await;
  let submitter = CheckoutSubmitter::new(
    base.join("api/stall/").unwrap(),
    Duration::from_millis(200),
  )
  .unwrap();
  let result = submitter
    .submit(&StaticToken::new("kiosk-token"), "scan-10", &two_bananas())
    .await;
  assert!(matches!(
    result,
    Err(SubmitError::Checkout(CheckoutError::Timeout))
  ));
}

#[tokio::test]
async fn auth_failure_never_reaches_the_endpoint() {
  let recorded = Recorded::default();
  let base = serve(recorded.clone()).await;

  let result = submitter(&base, "api/checkout/")
    .submit(&StaticToken::new(""), "scan-11", &two_bananas())
    .await;

  assert!(matches!(
    result,
    Err(SubmitError::Auth(AuthError::MissingToken))
  ));
  assert!(recorded.checkouts().is_empty());
}

#[tokio::test]
async fn client_credentials_token_is_cached() {
  let recorded = Recorded::default();
  let base = serve(recorded.clone()).await;
  let auth = ClientCredentials::new(
    reqwest::Client::new(),
    base.join("oauth/token").unwrap(),
    "kiosk",
    "s3cret",
    Some("pantry-api".to_string()),
  );
  let submitter = submitter(&base, "api/checkout/");

  for token in ["scan-12", "scan-13"] {
    submitter
      .submit(&auth, token, &two_bananas())
      .await
      .unwrap();
  }

  assert_eq!(recorded.token_requests.load(Ordering::SeqCst), 1);
  let checkouts = recorded.checkouts();
  assert_eq!(checkouts.len(), 2);
  assert!(
    checkouts
      .iter()
      .all(|(auth, _)| auth.as_deref() == Some("Bearer cc-token"))
  );
}

#[tokio::test]
async fn rejected_client_is_an_auth_error() {
  let recorded = Recorded::default();
  let base = serve(recorded.clone()).await;
  let auth = ClientCredentials::new(
    reqwest::Client::new(),
    base.join("oauth/token").unwrap(),
    "kiosk",
    "wrong",
    None,
  );

  let result = submitter(&base, "api/checkout/")
    .submit(&auth, "scan-14", &two_bananas())
    .await;

  assert!(matches!(
    result,
    Err(SubmitError::Auth(AuthError::Rejected { status: 401, .. }))
  ));
  assert!(recorded.checkouts().is_empty());
}

#[tokio::test]
async fn session_checkout_submits_the_latest_tally_once() {
  let recorded = Recorded::default();
  let base = serve(recorded.clone()).await;

  let dir = tempfile::tempdir().unwrap();
  let record = dir.path().join("shelf.txt");
  std::fs::write(
    &record,
    "banana, 0.95, 0.10, 0.10, 0.30, 0.40\n\
     banana, 0.90, 0.50, 0.10, 0.70, 0.40\n\
     carrot, 0.80, 0.10, 0.50, 0.30, 0.90\n\
     laptop, 0.99, 0.60, 0.60, 0.90, 0.90\n\
     donut, 0.30, 0.40, 0.40, 0.50, 0.50\n",
  )
  .unwrap();
  let detector = load_detector(RecordDetectorBuilder::new(&record))
    .await
    .unwrap();

  let session = CheckoutSession::start(
    "scan-15",
    detector,
    ImageFileInput::from_image(RgbImage::new(200, 100)),
    PantryRules::default(),
    Draw::default(),
    None::<liangcang::output::OutputWrapper>,
    SessionConfig {
      interval: Duration::from_millis(10),
      ..SessionConfig::default()
    },
  );
  tokio::time::sleep(Duration::from_millis(150)).await;
  assert!(session.latest().is_some());

  let receipt = session
    .checkout(&submitter(&base, "api/checkout/"), &StaticToken::new("kiosk-token"))
    .await
    .unwrap();
  assert_eq!(receipt.body["items"], "banana, banana, carrot");

  let checkouts = recorded.checkouts();
  assert_eq!(checkouts.len(), 1);
  let body = &checkouts[0].1;
  assert_eq!(body["token"], "scan-15");
  assert_eq!(body["tally"]["banana"]["exceeded"], true);
  assert_eq!(body["tally"]["carrot"]["exceeded"], false);
  assert!(body["tally"].get("laptop").is_none());
  assert!(body["tally"].get("donut").is_none());
}
