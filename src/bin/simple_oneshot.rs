// 该文件是 Shiliao （食疗） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像识别与饮食计划
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

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use url::Url;

use shiliao::{
  FromUrl, FromUrlWithScheme,
  food::NutritionTable,
  input::ImageFileInput,
  model::{DetectOptions, Labels, YoloV8Builder},
  output::{
    SaveImageFileOutput,
    draw::{Draw, resolve_font},
  },
  planner::{self, BASELINE_GRAMS},
  task::OneShotTask,
};

/// 单张图像识别参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// YOLOv8 ONNX 模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:thali.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 标注图输出路径，例如 image:thali_pred.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 食物重量，格式 LABEL=GRAMS，可重复
  #[arg(long = "weight", value_name = "LABEL=GRAMS", value_parser = parse_weight)]
  pub weights: Vec<(String, f64)>,
  /// 每日目标热量 (kcal)
  #[arg(long, value_name = "KCAL")]
  pub target_calories: Option<f64>,
  #[command(flatten)]
  pub detect: DetectOptions,
  /// 标签字体，缺省时使用内置字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
  /// 营养表覆盖文件 (TOML)
  #[arg(long, value_name = "FILE")]
  pub foods: Option<PathBuf>,
  /// 类别名称文件 (TOML)
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
}

fn parse_weight(value: &str) -> Result<(String, f64), String> {
  let (label, grams) = value
    .rsplit_once('=')
    .ok_or_else(|| format!("期望 LABEL=GRAMS，实际为 '{}'", value))?;
  let grams: f64 = grams
    .trim()
    .parse()
    .map_err(|e| format!("重量 '{}' 无效: {}", grams, e))?;
  if !grams.is_finite() || grams <= 0.0 {
    return Err(format!("重量必须为正数: {}", grams));
  }
  Ok((label.trim().to_string(), grams))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut table = NutritionTable::default();
  if let Some(path) = &args.foods {
    table = table
      .with_overlay(path)
      .with_context(|| format!("无法加载营养表 {}", path.display()))?;
  }

  let mut builder = YoloV8Builder::from_url(&args.model)?.options(args.detect);
  if let Some(path) = &args.labels {
    builder = builder.labels(Labels::from_toml_file(path)?);
  }
  let model = builder.build()?;

  let draw = Draw::default().with_font(resolve_font(args.font.as_deref())?);

  // 图像在任务中解码，这里只检查方案
  if args.input.scheme() != ImageFileInput::SCHEME {
    bail!(
      "输入必须使用 {} 方案，实际为 '{}'",
      ImageFileInput::SCHEME,
      args.input.scheme()
    );
  }
  let output = SaveImageFileOutput::from_url(&args.output)?.with_draw(draw);

  let prediction =
    OneShotTask::new(&model, &table).run_task(Path::new(args.input.path()), &output)?;
  info!("标注图已保存到 {}", output.path().display());

  if prediction.items.is_empty() {
    println!("未检测到食物");
    return Ok(());
  }

  let weights: HashMap<&str, f64> = args
    .weights
    .iter()
    .map(|(label, grams)| (label.as_str(), *grams))
    .collect();

  println!(
    "{:<16} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10}",
    "食物", "置信度", "重量(g)", "热量", "蛋白质(g)", "碳水(g)", "脂肪(g)"
  );
  let mut total = 0.0;
  for item in prediction.items.iter() {
    let label = item.detection.label.as_str();
    let weight = weights.get(label).copied().unwrap_or(BASELINE_GRAMS);
    let scaled = planner::scale(&item.food.per_100g, weight)?;
    total += scaled.calories.round();
    println!(
      "{:<16} {:>7.1}% {:>10} {:>10.0} {:>10.0} {:>10.0} {:>10.0}",
      label,
      item.detection.score * 100.0,
      weight,
      scaled.calories,
      scaled.protein,
      scaled.carbs,
      scaled.fat
    );
  }
  println!("总热量: {:.0} kcal", total);

  if let Some(target) = args.target_calories {
    if !target.is_finite() || target <= 0.0 {
      bail!("目标热量必须为正数: {}", target);
    }
    let entries = planner::plan(
      prediction
        .items
        .iter()
        .map(|item| (item.detection.label.as_str(), &item.food.per_100g)),
      target,
    )?;

    println!();
    println!("饮食计划 (目标 {:.0} kcal)", target);
    println!("{:<16} {:>14} {:>10}", "食物", "推荐重量(g)", "热量");
    for entry in entries.iter() {
      println!(
        "{:<16} {:>14.0} {:>10.0}",
        entry.label, entry.weight_g, entry.calories
      );
    }
  }

  Ok(())
}
