// 该文件是 Shiliao （食疗） 项目的一部分。
// src/service/predict.rs - 识别接口
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

use axum::{
  Json,
  body::Bytes,
  extract::{Multipart, State, multipart::MultipartRejection},
  response::{IntoResponse, Response},
};
use image::RgbImage;
use serde::Serialize;
use tracing::{error, info};

use super::{AppState, ServiceError};
use crate::{
  food::Nutrition,
  model::{DetectResult, Model},
  output::SaveImageFileOutput,
  task::{OneShotTask, Prediction},
};

const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct ItemResponse {
  #[serde(rename = "class")]
  pub class_name: String,
  pub confidence: f32,
  #[serde(rename = "box")]
  pub bbox: [f32; 4],
  pub calories_per_100g: Nutrition,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
  pub items: Vec<ItemResponse>,
  pub output_image: String,
}

impl PredictResponse {
  fn new(prediction: Prediction, output_image: String) -> Self {
    let items = prediction
      .items
      .into_iter()
      .map(|item| ItemResponse {
        class_name: item.detection.label,
        confidence: item.detection.score,
        bbox: item.detection.bbox,
        calories_per_100g: item.food.per_100g,
      })
      .collect();
    Self {
      items,
      output_image,
    }
  }
}

pub async fn predict<M>(
  State(state): State<AppState<M>>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Response
where
  M: Model<Input = RgbImage, Output = DetectResult> + Send + Sync + 'static,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  match handle_predict(state, multipart).await {
    Ok(response) => Json(response).into_response(),
    Err(e) => {
      error!("识别请求失败: {}", e);
      e.into_response()
    }
  }
}

async fn handle_predict<M>(
  state: AppState<M>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<PredictResponse, ServiceError>
where
  M: Model<Input = RgbImage, Output = DetectResult> + Send + Sync + 'static,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  let mut multipart = multipart.map_err(|e| ServiceError::MultipartError(e.body_text()))?;
  let (file_name, bytes) = read_file_field(&mut multipart).await?;
  info!("收到上传文件 {:?}，{} 字节", file_name, bytes.len());

  // 解码、推理与写文件都是阻塞操作
  tokio::task::spawn_blocking(move || -> Result<PredictResponse, ServiceError> {
    let stored = state.store.store(file_name.as_deref(), &bytes)?;
    let output = SaveImageFileOutput::new(&stored.output_path, state.draw.clone());
    let result = OneShotTask::new(state.model.as_ref(), &state.table)
      .run_task(&stored.input_path, &output)
      .map_err(ServiceError::from)
      .and_then(|prediction| {
        let output_image = state.store.public_path(&stored.output_path)?;
        Ok((prediction, output_image))
      });

    match result {
      Ok((prediction, output_image)) => {
        info!("请求 {} 完成，共 {} 个食物", stored.id, prediction.items.len());
        Ok(PredictResponse::new(prediction, output_image))
      }
      Err(e) => {
        // 失败的请求不保留文件
        state.store.discard(&stored);
        Err(e)
      }
    }
  })
  .await?
}

async fn read_file_field(
  multipart: &mut Multipart,
) -> Result<(Option<String>, Bytes), ServiceError> {
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| ServiceError::MultipartError(e.body_text()))?
  {
    if field.name() != Some(FILE_FIELD) {
      continue;
    }
    let file_name = field.file_name().map(str::to_string);
    let bytes = field
      .bytes()
      .await
      .map_err(|e| ServiceError::MultipartError(e.body_text()))?;
    return Ok((file_name, bytes));
  }
  Err(ServiceError::MissingFile)
}
