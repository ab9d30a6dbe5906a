// 该文件是 Shiliao （食疗） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 ONNX 检测模型
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

use std::fmt::Display;
use std::sync::Mutex;

use image::{Rgb, RgbImage, imageops::FilterType};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectItem, DetectResult, Labels, Model},
};

const YOLOV8_BOX_ROWS: usize = 4;
const YOLOV8_PAD_VALUE: u8 = 114;
const YOLOV8_METADATA_NAMES: &str = "names";
const YOLOV8_INTRA_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum YoloV8Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("ONNX Runtime 错误: {0}, 错误: {1}")]
  OrtError(String, String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("推理错误: {0}")]
  InferenceError(String),
}

impl YoloV8Error {
  fn ort<E: Display>(msg: &str, e: E) -> Self {
    YoloV8Error::OrtError(msg.to_string(), e.to_string())
  }
}

/// 检测参数，同时作为命令行参数组
#[derive(Debug, Clone, Copy, PartialEq, clap::Args)]
pub struct DetectOptions {
  /// 置信度阈值
  #[arg(long, default_value_t = 0.35)]
  pub confidence: f32,
  /// NMS IoU 阈值
  #[arg(long, default_value_t = 0.7)]
  pub iou: f32,
  /// 推理输入边长 (32 的倍数)
  #[arg(long, default_value_t = 640)]
  pub image_size: u32,
  /// 单张图像最多保留的检测数
  #[arg(long, default_value_t = 300)]
  pub max_detections: usize,
}

impl Default for DetectOptions {
  fn default() -> Self {
    Self {
      confidence: 0.35,
      iou: 0.7,
      image_size: 640,
      max_detections: 300,
    }
  }
}

pub struct YoloV8 {
  session: Mutex<Session>,
  input_name: String,
  labels: Labels,
  options: DetectOptions,
}

pub struct YoloV8Builder {
  model_path: String,
  labels: Option<Labels>,
  options: DetectOptions,
}

impl FromUrlWithScheme for YoloV8Builder {
  const SCHEME: &'static str = "yolov8";
}

impl FromUrl for YoloV8Builder {
  type Error = YoloV8Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloV8Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    if url.path().is_empty() {
      return Err(YoloV8Error::ModelPathError("模型路径为空".to_string()));
    }

    Ok(YoloV8Builder::new(url.path()))
  }
}

impl YoloV8Builder {
  pub fn new(model_path: &str) -> Self {
    Self {
      model_path: model_path.to_string(),
      labels: None,
      options: DetectOptions::default(),
    }
  }

  pub fn labels(mut self, labels: Labels) -> Self {
    self.labels = Some(labels);
    self
  }

  pub fn options(mut self, options: DetectOptions) -> Self {
    self.options = options;
    self
  }

  pub fn build(self) -> Result<YoloV8, YoloV8Error> {
    info!("加载模型文件: {}", self.model_path);
    let size = std::fs::metadata(&self.model_path)?.len();
    debug!("模型文件大小: {:.2} MB", size as f64 / (1024.0 * 1024.0));

    if self.options.image_size == 0 || self.options.image_size % 32 != 0 {
      return Err(YoloV8Error::ModelInvalid(format!(
        "输入尺寸 {} 必须是 32 的正整数倍",
        self.options.image_size
      )));
    }

    info!("创建 ONNX Runtime 推理会话");
    let session = Session::builder()
      .map_err(|e| YoloV8Error::ort("无法创建会话构建器", e))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(|e| YoloV8Error::ort("无法设置优化等级", e))?
      .with_intra_threads(YOLOV8_INTRA_THREADS)
      .map_err(|e| YoloV8Error::ort("无法设置线程数", e))?
      .commit_from_file(&self.model_path)
      .map_err(|e| YoloV8Error::ort("无法加载模型", e))?;

    if session.inputs.len() != 1 {
      return Err(YoloV8Error::ModelInvalid(format!(
        "预期模型输入数量为 1, 实际为 {}",
        session.inputs.len()
      )));
    }
    if session.outputs.is_empty() {
      return Err(YoloV8Error::ModelInvalid("模型没有输出".to_string()));
    }

    let input_name = session.inputs[0].name.clone();
    debug!("模型输入: {}", input_name);
    debug!(
      "模型输出: {:?}",
      session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
    );

    let labels = match self.labels {
      Some(labels) => labels,
      None => match labels_from_session(&session) {
        Some(labels) => labels,
        None => {
          warn!("模型中没有可用的类别名称元数据，使用类别编号作为标签");
          Labels::default()
        }
      },
    };
    info!("模型加载完成，共 {} 个类别", labels.len());

    Ok(YoloV8 {
      session: Mutex::new(session),
      input_name,
      labels,
      options: self.options,
    })
  }
}

fn labels_from_session(session: &Session) -> Option<Labels> {
  let metadata = session.metadata().ok()?;
  let names = metadata.custom(YOLOV8_METADATA_NAMES).ok()??;
  Labels::from_metadata(&names)
}

/// 信箱缩放参数，用于把推理坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
  width: f32,
  height: f32,
}

impl Letterbox {
  fn new(width: u32, height: u32, size: u32) -> Self {
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let (new_w, new_h) = Self::scaled(width, height, scale, size);
    Self {
      scale,
      pad_x: ((size - new_w) / 2) as f32,
      pad_y: ((size - new_h) / 2) as f32,
      width: width as f32,
      height: height as f32,
    }
  }

  fn scaled(width: u32, height: u32, scale: f32, size: u32) -> (u32, u32) {
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    (new_w, new_h)
  }

  /// (cx, cy, w, h) 推理坐标 => [x_min, y_min, x_max, y_max] 原图坐标
  fn to_original(&self, cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    let map_x = |x: f32| ((x - self.pad_x) / self.scale).clamp(0.0, self.width);
    let map_y = |y: f32| ((y - self.pad_y) / self.scale).clamp(0.0, self.height);
    [
      map_x(cx - w / 2.0),
      map_y(cy - h / 2.0),
      map_x(cx + w / 2.0),
      map_y(cy + h / 2.0),
    ]
  }
}

impl YoloV8 {
  /// 预处理图像，输出 NCHW 格式、归一化到 [0, 1] 的张量数据
  fn preprocess(&self, image: &RgbImage) -> (Vec<f32>, Letterbox) {
    let size = self.options.image_size;
    let letterbox = Letterbox::new(image.width(), image.height(), size);
    let (new_w, new_h) = Letterbox::scaled(image.width(), image.height(), letterbox.scale, size);

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([YOLOV8_PAD_VALUE; 3]));
    image::imageops::replace(
      &mut canvas,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    let plane = (size * size) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (idx, pixel) in canvas.pixels().enumerate() {
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    (data, letterbox)
  }
}

/// 解码 YOLOv8 输出，形状为 [1, 4 + 类别数, 候选数]，部分导出为转置布局
fn postprocess(
  shape: &[i64],
  data: &[f32],
  letterbox: &Letterbox,
  options: &DetectOptions,
  labels: &Labels,
) -> Result<DetectResult, YoloV8Error> {
  let (rows, proposals, transposed) = match shape {
    [1, a, b] if *a > 0 && *b > 0 => {
      let (a, b) = (*a as usize, *b as usize);
      if a <= b { (a, b, false) } else { (b, a, true) }
    }
    _ => {
      return Err(YoloV8Error::InferenceError(format!(
        "无法识别的输出形状: {:?}",
        shape
      )));
    }
  };
  if rows <= YOLOV8_BOX_ROWS || data.len() != rows * proposals {
    return Err(YoloV8Error::InferenceError(format!(
      "输出大小不匹配: 形状 {:?}, 数据长度 {}",
      shape,
      data.len()
    )));
  }

  let num_classes = rows - YOLOV8_BOX_ROWS;
  let at = |row: usize, i: usize| {
    if transposed {
      data[i * rows + row]
    } else {
      data[row * proposals + i]
    }
  };

  let mut candidates = Vec::new();
  for i in 0..proposals {
    let mut best_score = f32::MIN;
    let mut best_class = 0usize;
    for c in 0..num_classes {
      let score = at(YOLOV8_BOX_ROWS + c, i);
      if score > best_score {
        best_score = score;
        best_class = c;
      }
    }

    if best_score < options.confidence {
      continue;
    }

    let bbox = letterbox.to_original(at(0, i), at(1, i), at(2, i), at(3, i));
    candidates.push(DetectItem {
      class_id: best_class as u32,
      label: labels.name(best_class as u32),
      score: best_score,
      bbox,
    });
  }

  debug!("置信度过滤后剩余 {} 个候选框", candidates.len());
  let items = nms(candidates, options.iou, options.max_detections);
  Ok(DetectResult::from(items))
}

impl Model for YoloV8 {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = YoloV8Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("设置模型输入");
    let (data, letterbox) = self.preprocess(input);
    let size = self.options.image_size as usize;
    let tensor = Tensor::from_array(([1usize, 3, size, size], data.into_boxed_slice()))
      .map_err(|e| YoloV8Error::ort("无法创建输入张量", e))?
      .into_dyn();

    let mut session = self
      .session
      .lock()
      .map_err(|_| YoloV8Error::InferenceError("推理会话锁已损坏".to_string()))?;

    debug!("执行模型推理");
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => tensor])
      .map_err(|e| YoloV8Error::ort("推理失败", e))?;

    debug!("获取模型输出");
    let output = outputs
      .values()
      .next()
      .ok_or_else(|| YoloV8Error::InferenceError("模型没有产生输出".to_string()))?;
    let (shape, data) = output
      .try_extract_tensor::<f32>()
      .map_err(|e| YoloV8Error::ort("无法读取输出张量", e))?;
    let shape: Vec<i64> = shape.iter().copied().collect();

    let result = postprocess(&shape, data, &letterbox, &self.options, &self.labels)?;
    debug!("检测到 {} 个物体", result.len());
    Ok(result)
  }
}

/// 按类别的非极大值抑制，结果按置信度降序
fn nms(mut items: Vec<DetectItem>, iou_threshold: f32, max_detections: usize) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<DetectItem> = Vec::new();
  for item in items {
    if result.len() >= max_detections {
      break;
    }
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == item.class_id && kept.iou(&item) > iou_threshold);
    if !suppressed {
      result.push(item);
    }
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id,
      label: format!("class_{}", class_id),
      score,
      bbox,
    }
  }

  #[test]
  fn test_builder_from_url() {
    let url = Url::parse("yolov8:///models/best.onnx").unwrap();
    let builder = YoloV8Builder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, "/models/best.onnx");

    let relative = Url::parse("yolov8:best.onnx").unwrap();
    assert_eq!(YoloV8Builder::from_url(&relative).unwrap().model_path, "best.onnx");
  }

  #[test]
  fn test_builder_rejects_other_schemes() {
    let url = Url::parse("yolo26:///models/best.rknn").unwrap();
    assert!(matches!(
      YoloV8Builder::from_url(&url),
      Err(YoloV8Error::ModelPathError(_))
    ));
  }

  #[test]
  fn test_build_missing_model_is_load_error() {
    let result = YoloV8Builder::new("/nonexistent/best.onnx").build();
    assert!(matches!(result, Err(YoloV8Error::ModelLoadError(_))));
  }

  #[test]
  fn test_letterbox_wide_image() {
    let lb = Letterbox::new(1280, 640, 640);
    assert!((lb.scale - 0.5).abs() < 1e-6);
    assert_eq!(lb.pad_x, 0.0);
    assert_eq!(lb.pad_y, 160.0);

    // 画布中心对应原图中心
    let bbox = lb.to_original(320.0, 320.0, 100.0, 50.0);
    assert_eq!(bbox, [540.0, 270.0, 740.0, 370.0]);
  }

  #[test]
  fn test_letterbox_clamps_to_image() {
    let lb = Letterbox::new(640, 640, 640);
    let bbox = lb.to_original(10.0, 630.0, 40.0, 40.0);
    assert_eq!(bbox, [0.0, 610.0, 30.0, 640.0]);
  }

  #[test]
  fn test_postprocess_decodes_and_filters() {
    let lb = Letterbox::new(640, 640, 640);
    let labels = Labels::new(vec!["Dal".to_string(), "Roti".to_string()]);
    // 6 个候选框（后 3 个为空），行依次为 cx, cy, w, h, Dal, Roti
    #[rustfmt::skip]
    let data = [
      100.0, 300.0, 500.0, 0.0, 0.0, 0.0,
      100.0, 300.0, 500.0, 0.0, 0.0, 0.0,
       40.0,  20.0,  60.0, 0.0, 0.0, 0.0,
       40.0,  20.0,  60.0, 0.0, 0.0, 0.0,
       0.90,  0.10,  0.20, 0.0, 0.0, 0.0,
       0.05,  0.60,  0.30, 0.0, 0.0, 0.0,
    ];

    let result = postprocess(&[1, 6, 6], &data, &lb, &DetectOptions::default(), &labels).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.items[0].label, "Dal");
    assert_eq!(result.items[0].bbox, [80.0, 80.0, 120.0, 120.0]);
    assert_eq!(result.items[1].label, "Roti");
    assert_eq!(result.items[1].class_id, 1);
    assert_eq!(result.items[1].bbox, [290.0, 290.0, 310.0, 310.0]);
  }

  #[test]
  fn test_postprocess_transposed_layout() {
    let lb = Letterbox::new(640, 640, 640);
    let labels = Labels::default();
    // 8 个候选框，每个候选框一行: cx, cy, w, h, 两个类别分数
    let mut data = [0.0f32; 48];
    data[..6].copy_from_slice(&[100.0, 100.0, 40.0, 40.0, 0.1, 0.8]);

    let result = postprocess(&[1, 8, 6], &data, &lb, &DetectOptions::default(), &labels).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].class_id, 1);
    assert_eq!(result.items[0].label, "class_1");
  }

  #[test]
  fn test_postprocess_rejects_bad_shape() {
    let lb = Letterbox::new(640, 640, 640);
    let options = DetectOptions::default();
    let labels = Labels::default();
    assert!(matches!(
      postprocess(&[1, 6], &[0.0; 6], &lb, &options, &labels),
      Err(YoloV8Error::InferenceError(_))
    ));
    assert!(matches!(
      postprocess(&[1, 6, 3], &[0.0; 6], &lb, &options, &labels),
      Err(YoloV8Error::InferenceError(_))
    ));
  }

  #[test]
  fn test_nms_is_class_aware() {
    let items = vec![
      item(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.9, [1.0, 1.0, 11.0, 11.0]),
      item(1, 0.8, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.7, [50.0, 50.0, 60.0, 60.0]),
    ];
    let kept = nms(items, 0.5, 300);

    let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
    assert_eq!(scores, vec![0.9, 0.8, 0.7]);
  }

  #[test]
  fn test_nms_limits_detections() {
    let items = (0..10)
      .map(|i| item(0, 0.5 + i as f32 * 0.01, [i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0]))
      .collect();
    assert_eq!(nms(items, 0.5, 3).len(), 3);
  }
}
