// 该文件是 Shiliao （食疗） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{DetectItem, DetectResult};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_HORIZONTAL_PADDING: u32 = 4;
const BOX_THICKNESS: i32 = 3;
const BOX_COLOR: [u8; 3] = [255, 165, 0]; // 橙色
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Error, Debug)]
pub enum FontError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

// 内置字体 (DejaVu Sans)
const DEFAULT_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

pub fn default_font() -> Result<FontArc, FontError> {
  Ok(FontArc::try_from_slice(DEFAULT_FONT)?)
}

/// 优先使用指定字体，未指定或加载失败时使用内置字体
pub fn resolve_font(path: Option<&Path>) -> Result<FontArc, FontError> {
  if let Some(path) = path {
    match load_font(path) {
      Ok(font) => return Ok(font),
      Err(e) => warn!("无法加载字体 {}: {}，使用内置字体", path.display(), e),
    }
  }
  default_font()
}

/// 从 TrueType/OpenType 文件加载字体
pub fn load_font(path: &Path) -> Result<FontArc, FontError> {
  let data = std::fs::read(path)?;
  let font = FontArc::try_from_vec(data)?;
  info!("加载字体: {}", path.display());
  Ok(font)
}

/// 在图像上绘制边框与标签；没有字体时只绘制边框
#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  thickness: i32,
  color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      thickness: BOX_THICKNESS,
      color: BOX_COLOR,
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.items.iter() {
      self.draw_bbox_with_label(image, item);
    }
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(self.color);
    // 由外向内逐层绘制，得到加粗边框
    for t in 0..self.thickness {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", item.label, item.score);
    let scale = PxScale::from(self.font_size);
    let (text_w, text_h) = text_size(scale, font, &label);

    let label_w = (text_w + 2 * LABEL_TEXT_HORIZONTAL_PADDING).min((w - x_min) as u32);
    let label_h = text_h + 2 * LABEL_TEXT_VERTICAL_PADDING as u32;
    // 标签放在边框上方，空间不足时放进边框内部
    let label_y = if y_min >= label_h as i32 {
      y_min - label_h as i32
    } else {
      y_min
    };

    if label_w > 0 && label_h > 0 {
      let rect = Rect::at(x_min, label_y).of_size(label_w, label_h);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb(TEXT_COLOR),
        x_min + LABEL_TEXT_HORIZONTAL_PADDING as i32,
        label_y + LABEL_TEXT_VERTICAL_PADDING,
        scale,
        font,
        &label,
      );
    }
  }
}
