// 该文件是 Shiliao （食疗） 项目的一部分。
// src/main.rs - 服务主程序
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

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shiliao::{
  FromUrl,
  food::NutritionTable,
  input::UploadStore,
  model::{Labels, YoloV8Builder},
  output::draw::{Draw, resolve_font},
  service::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  info!("Shiliao 食物营养估算服务");
  info!("模型文件路径: {}", args.model);
  info!("静态目录: {}", args.static_dir.display());
  info!("检测参数: {:?}", args.detect);

  let mut table = NutritionTable::default();
  if let Some(path) = &args.foods {
    table = table
      .with_overlay(path)
      .with_context(|| format!("无法加载营养表 {}", path.display()))?;
  }
  info!("营养表共 {} 种食物", table.len());

  let mut builder = YoloV8Builder::from_url(&args.model)?.options(args.detect);
  if let Some(path) = &args.labels {
    let labels =
      Labels::from_toml_file(path).with_context(|| format!("无法加载标签 {}", path.display()))?;
    builder = builder.labels(labels);
  }
  let model = builder.build().context("模型加载失败")?;

  let font = resolve_font(args.font.as_deref()).context("无法加载字体")?;
  let draw = Draw::default().with_font(font);

  std::fs::create_dir_all(&args.static_dir)
    .with_context(|| format!("无法创建静态目录 {}", args.static_dir.display()))?;
  let state = AppState::new(model, table, draw, UploadStore::new(&args.static_dir));
  let app = service::router(state, args.max_upload_bytes());

  let listener = TcpListener::bind(args.listen)
    .await
    .with_context(|| format!("无法监听 {}", args.listen))?;
  service::serve(listener, app).await?;

  Ok(())
}
