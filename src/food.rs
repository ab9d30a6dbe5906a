// 该文件是 Shiliao （食疗） 项目的一部分。
// src/food.rs - 食物营养表
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
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// 每 100 克的营养成分
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrition {
  /// 热量 (kcal)
  pub calories: f64,
  /// 蛋白质 (g)
  pub protein: f64,
  /// 碳水化合物 (g)
  pub carbs: f64,
  /// 脂肪 (g)
  pub fat: f64,
}

impl Nutrition {
  pub const ZERO: Nutrition = Nutrition::new(0.0, 0.0, 0.0, 0.0);

  pub const fn new(calories: f64, protein: f64, carbs: f64, fat: f64) -> Self {
    Self {
      calories,
      protein,
      carbs,
      fat,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoodEntry {
  pub label: String,
  pub per_100g: Nutrition,
}

// 内置营养数据，标签与模型类别名称一致
const BUILTIN_FOODS: [(&str, Nutrition); 6] = [
  ("Biryani", Nutrition::new(170.0, 5.0, 28.0, 6.0)),
  ("Shahi Paneer", Nutrition::new(300.0, 12.0, 8.0, 25.0)),
  ("Dal", Nutrition::new(120.0, 9.0, 15.0, 2.0)),
  ("Roti", Nutrition::new(120.0, 3.0, 20.0, 2.0)),
  ("Rice", Nutrition::new(130.0, 2.0, 28.0, 0.5)),
  ("Jalebi", Nutrition::new(150.0, 1.0, 35.0, 0.5)),
];

#[derive(Error, Debug)]
pub enum FoodTableError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("营养表格式错误: {0}")]
  ParseError(#[from] toml::de::Error),
  #[error("食物 {0} 的营养数据无效")]
  InvalidEntry(String),
}

/// 覆盖文件格式:
///
/// ```toml
/// [foods."Gulab Jamun"]
/// calories = 380
/// protein = 6
/// carbs = 52
/// fat = 15
/// ```
#[derive(Debug, Deserialize)]
struct FoodTableFile {
  #[serde(default)]
  foods: HashMap<String, Nutrition>,
}

/// 食物营养表，启动时构建，之后只读
#[derive(Debug, Clone)]
pub struct NutritionTable {
  entries: HashMap<String, Nutrition>,
}

impl Default for NutritionTable {
  fn default() -> Self {
    let entries = BUILTIN_FOODS
      .iter()
      .map(|(label, nutrition)| (label.to_string(), *nutrition))
      .collect();
    Self { entries }
  }
}

impl NutritionTable {
  /// 查询食物营养，未知标签返回全零
  pub fn lookup(&self, label: &str) -> Nutrition {
    self.entries.get(label).copied().unwrap_or(Nutrition::ZERO)
  }

  /// 检测标签对应的营养条目，未知标签的营养为全零
  pub fn entry(&self, label: &str) -> FoodEntry {
    FoodEntry {
      label: label.to_string(),
      per_100g: self.lookup(label),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// 以内置表为基础，合并 TOML 文件中的条目
  pub fn with_overlay(mut self, path: &Path) -> Result<Self, FoodTableError> {
    info!("加载营养表文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    self.merge_toml(&content)?;
    Ok(self)
  }

  fn merge_toml(&mut self, content: &str) -> Result<(), FoodTableError> {
    let file: FoodTableFile = toml::from_str(content)?;
    for (label, nutrition) in file.foods {
      let values = [
        nutrition.calories,
        nutrition.protein,
        nutrition.carbs,
        nutrition.fat,
      ];
      if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(FoodTableError::InvalidEntry(label));
      }
      debug!("营养表条目: {} => {:?}", label, nutrition);
      self.entries.insert(label, nutrition);
    }
    Ok(())
  }
}
