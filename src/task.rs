// 该文件是 Shiliao （食疗） 项目的一部分。
// src/task.rs - 识别任务
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

use std::path::Path;
use std::time::Instant;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  food::{FoodEntry, NutritionTable},
  input::{ImageFileInput, ImageFileInputError},
  model::{DetectItem, DetectResult, Model},
  output::Render,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("无法读取图像: {0}")]
  InputError(#[from] ImageFileInputError),
  #[error("推理失败: {0}")]
  ModelError(#[source] BoxError),
  #[error("渲染失败: {0}")]
  RenderError(#[source] BoxError),
}

/// 检测结果与营养数据的组合
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedItem {
  pub detection: DetectItem,
  pub food: FoodEntry,
}

#[derive(Debug, Clone, Default)]
pub struct Prediction {
  pub items: Vec<PredictedItem>,
}

impl Prediction {
  pub fn join(result: &DetectResult, table: &NutritionTable) -> Self {
    let items = result
      .items
      .iter()
      .map(|detection| PredictedItem {
        detection: detection.clone(),
        food: table.entry(&detection.label),
      })
      .collect();
    Self { items }
  }
}

/// 单张图像的识别流程: 解码 → 推理 → 查询营养表 → 标注输出
pub struct OneShotTask<'a, M> {
  model: &'a M,
  table: &'a NutritionTable,
}

impl<'a, M> OneShotTask<'a, M>
where
  M: Model<Input = RgbImage, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  pub fn new(model: &'a M, table: &'a NutritionTable) -> Self {
    Self { model, table }
  }

  pub fn run_task<O>(&self, input: &Path, output: &O) -> Result<Prediction, TaskError>
  where
    O: Render<RgbImage, DetectResult>,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    let frame = ImageFileInput::open(input)?.into_image();
    info!(
      "输入图像获取成功 ({}x{})，开始推理...",
      frame.width(),
      frame.height()
    );

    let now = Instant::now();
    let result = self
      .model
      .infer(&frame)
      .map_err(|e| TaskError::ModelError(Box::new(e)))?;
    info!("推理完成，检测到 {} 个对象，耗时: {:.2?}", result.len(), now.elapsed());

    for item in result.items.iter() {
      debug!(
        "  - {}: {:.2}% at ({:.0}, {:.0}, {:.0}, {:.0})",
        item.label,
        item.score * 100.0,
        item.bbox[0],
        item.bbox[1],
        item.bbox[2],
        item.bbox[3]
      );
    }

    let now = Instant::now();
    output
      .render_result(&frame, &result)
      .map_err(|e| TaskError::RenderError(Box::new(e)))?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(Prediction::join(&result, self.table))
  }
}
