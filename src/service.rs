// 该文件是 Shiliao （食疗） 项目的一部分。
// src/service.rs - HTTP 服务
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

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::DefaultBodyLimit,
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use image::RgbImage;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
  food::NutritionTable,
  input::{UploadError, UploadStore},
  model::{DetectResult, Model},
  output::draw::Draw,
  task::TaskError,
};

mod page;
mod predict;

pub use self::predict::{ItemResponse, PredictResponse};

/// 请求处理中的错误，统一返回 500 和 `{"error": ...}`
#[derive(Error, Debug)]
pub enum ServiceError {
  #[error("上传数据无效: {0}")]
  MultipartError(String),
  #[error("缺少上传文件字段 'file'")]
  MissingFile,
  #[error("{0}")]
  UploadError(#[from] UploadError),
  #[error("{0}")]
  TaskError(#[from] TaskError),
  #[error("后台任务失败: {0}")]
  JoinError(#[from] tokio::task::JoinError),
}

impl IntoResponse for ServiceError {
  fn into_response(self) -> Response {
    (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(json!({ "error": self.to_string() })),
    )
      .into_response()
  }
}

/// 进程级只读状态，启动时初始化
pub struct AppState<M> {
  pub model: Arc<M>,
  pub table: Arc<NutritionTable>,
  pub draw: Draw,
  pub store: UploadStore,
}

impl<M> Clone for AppState<M> {
  fn clone(&self) -> Self {
    Self {
      model: Arc::clone(&self.model),
      table: Arc::clone(&self.table),
      draw: self.draw.clone(),
      store: self.store.clone(),
    }
  }
}

impl<M> AppState<M> {
  pub fn new(model: M, table: NutritionTable, draw: Draw, store: UploadStore) -> Self {
    Self {
      model: Arc::new(model),
      table: Arc::new(table),
      draw,
      store,
    }
  }
}

pub fn router<M>(state: AppState<M>, max_upload_bytes: usize) -> Router
where
  M: Model<Input = RgbImage, Output = DetectResult> + Send + Sync + 'static,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  let static_dir = state.store.root().to_path_buf();

  Router::new()
    .route("/", get(page::home))
    .route("/predict/", post(predict::predict::<M>))
    .nest_service("/static", ServeDir::new(static_dir))
    .layer(DefaultBodyLimit::max(max_upload_bytes))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
  info!("服务监听于 http://{}", listener.local_addr()?);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(e) => warn!("无法监听中断信号: {}", e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::tests::{FixedModel, detection};
  use axum::{
    body::Body,
    http::{Request, header},
  };
  use http_body_util::BodyExt;
  use image::Rgb;
  use tower::ServiceExt;

  const BOUNDARY: &str = "shiliao-test-boundary";
  const MAX_UPLOAD: usize = 4 * 1024 * 1024;

  fn app(dir: &std::path::Path, model: FixedModel) -> Router {
    app_with_limit(dir, model, MAX_UPLOAD)
  }

  fn app_with_limit(dir: &std::path::Path, model: FixedModel, limit: usize) -> Router {
    let state = AppState::new(
      model,
      NutritionTable::default(),
      Draw::default(),
      UploadStore::new(dir),
    );
    router(state, limit)
  }

  fn files_under(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
      return files;
    };
    for entry in entries {
      let path = entry.unwrap().path();
      if path.is_dir() {
        files.extend(files_under(&path));
      } else {
        files.push(path);
      }
    }
    files
  }

  fn food_model() -> FixedModel {
    FixedModel {
      items: vec![
        detection("Dal", 0.88, [2.0, 2.0, 20.0, 20.0]),
        detection("Gulab Jamun", 0.51, [10.0, 10.0, 30.0, 30.0]),
      ],
      fail: false,
    }
  }

  fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(32, 32, Rgb([180, 120, 60]));
    let mut bytes = Vec::new();
    image
      .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    bytes
  }

  fn multipart_request(field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
      format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
      )
      .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
      .method("POST")
      .uri("/predict/")
      .header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
      )
      .body(Body::from(body))
      .unwrap()
  }

  async fn json_body(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
  }

  #[tokio::test]
  async fn test_home_page() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(dir.path(), food_model())
      .oneshot(Request::get("/").body(Body::empty()).unwrap())
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let html = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(html.contains("id=\"uploadForm\""));
    assert!(html.contains("/predict/"));
  }

  #[tokio::test]
  async fn test_predict_returns_items_and_image() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), food_model());

    let response = app
      .clone()
      .oneshot(multipart_request("file", "thali.png", &png_bytes()))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["class"], "Dal");
    assert!((items[0]["confidence"].as_f64().unwrap() - 0.88).abs() < 1e-6);
    assert_eq!(items[0]["calories_per_100g"]["calories"], 120.0);
    assert_eq!(items[0]["calories_per_100g"]["protein"], 9.0);
    assert_eq!(items[0]["calories_per_100g"]["carbs"], 15.0);
    assert_eq!(items[0]["calories_per_100g"]["fat"], 2.0);
    assert_eq!(items[0]["box"].as_array().unwrap().len(), 4);
    assert_eq!(items[1]["class"], "Gulab Jamun");
    assert_eq!(items[1]["calories_per_100g"]["calories"], 0.0);
    assert_eq!(items[1]["calories_per_100g"]["fat"], 0.0);

    let output_image = body["output_image"].as_str().unwrap();
    assert!(output_image.starts_with("/static/predictions/"));
    assert!(output_image.ends_with(".png"));
    assert!(!output_image.contains("thali"));

    let response = app
      .oneshot(Request::get(output_image).body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let annotated = image::load_from_memory(&bytes).unwrap().to_rgb8();
    assert_eq!(annotated.get_pixel(2, 2), &Rgb([255, 165, 0]));
  }

  #[tokio::test]
  async fn test_predict_same_filename_does_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), food_model());

    let first = json_body(
      app
        .clone()
        .oneshot(multipart_request("file", "plate.png", &png_bytes()))
        .await
        .unwrap(),
    )
    .await;
    let second = json_body(
      app
        .oneshot(multipart_request("file", "plate.png", &png_bytes()))
        .await
        .unwrap(),
    )
    .await;

    assert_ne!(first["output_image"], second["output_image"]);
  }

  #[tokio::test]
  async fn test_predict_non_image_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(dir.path(), food_model())
      .oneshot(multipart_request("file", "notes.txt", b"just some text"))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert!(files_under(dir.path()).is_empty());
  }

  #[tokio::test]
  async fn test_predict_model_failure_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let model = FixedModel {
      items: vec![],
      fail: true,
    };
    let response = app(dir.path(), model)
      .oneshot(multipart_request("file", "thali.png", &png_bytes()))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("fixed model error"));
    assert!(files_under(dir.path()).is_empty());
  }

  #[tokio::test]
  async fn test_predict_html_upload_is_not_served_as_html() {
    let dir = tempfile::tempdir().unwrap();
    let mut payload = png_bytes();
    payload.extend_from_slice(b"<script>alert(document.cookie)</script>");

    let response = app(dir.path(), food_model())
      .oneshot(multipart_request("file", "evil.html", &payload))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let files = files_under(dir.path());
    assert_eq!(files.len(), 2);
    for file in files {
      assert_eq!(file.extension().unwrap(), "png", "{}", file.display());
    }
  }

  #[tokio::test]
  async fn test_predict_oversized_upload_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let response = app_with_limit(dir.path(), food_model(), 1024)
      .oneshot(multipart_request("file", "big.png", &vec![0u8; 8 * 1024]))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert!(files_under(dir.path()).is_empty());
  }

  #[tokio::test]
  async fn test_predict_missing_field_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(dir.path(), food_model())
      .oneshot(multipart_request("photo", "thali.png", &png_bytes()))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"], ServiceError::MissingFile.to_string());
  }

  #[tokio::test]
  async fn test_predict_without_multipart_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let request = Request::builder()
      .method("POST")
      .uri("/predict/")
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from("{}"))
      .unwrap();
    let response = app(dir.path(), food_model()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(!body["error"].as_str().unwrap().is_empty());
  }
}
