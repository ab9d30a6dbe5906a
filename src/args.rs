// 该文件是 Shiliao （食疗） 项目的一部分。
// src/args.rs - 服务参数配置
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

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use url::Url;

use shiliao::model::DetectOptions;

/// Shiliao 食物识别与营养估算服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// YOLOv8 ONNX 模型，例如 yolov8:best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 监听地址
  #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8000")]
  pub listen: SocketAddr,

  /// 静态文件目录，存放上传图像与标注结果
  #[arg(long, value_name = "DIR", default_value = "static")]
  pub static_dir: PathBuf,

  #[command(flatten)]
  pub detect: DetectOptions,

  /// 标签字体，缺省或加载失败时使用内置字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 营养表覆盖文件 (TOML)
  #[arg(long, value_name = "FILE")]
  pub foods: Option<PathBuf>,

  /// 类别名称文件 (TOML)，缺省时读取模型元数据
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,

  /// 上传大小上限 (MB)
  #[arg(long, value_name = "MB", default_value_t = 20)]
  pub max_upload_mb: usize,
}

impl Args {
  pub fn max_upload_bytes(&self) -> usize {
    self.max_upload_mb.saturating_mul(1024 * 1024)
  }
}
