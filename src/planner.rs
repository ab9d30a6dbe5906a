// 该文件是 Shiliao （食疗） 项目的一部分。
// src/planner.rs - 按比例的饮食计划
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

//! 与网页端计算器相同的算法：按重量线性换算营养，
//! 以及把目标热量按各食物每 100 克热量的比例分配。

use thiserror::Error;

use crate::food::Nutrition;

pub const BASELINE_GRAMS: f64 = 100.0;

#[derive(Error, Debug, PartialEq)]
pub enum PlanError {
  #[error("重量必须为正数: {0}")]
  InvalidWeight(f64),
  #[error("目标热量无效: {0}")]
  InvalidTarget(f64),
  #[error("检测到的食物都没有热量数据")]
  NoCalories,
}

/// 按重量换算营养成分: value × weight / 100
pub fn scale(per_100g: &Nutrition, weight_g: f64) -> Result<Nutrition, PlanError> {
  if !weight_g.is_finite() || weight_g <= 0.0 {
    return Err(PlanError::InvalidWeight(weight_g));
  }
  let factor = weight_g / BASELINE_GRAMS;
  Ok(Nutrition::new(
    per_100g.calories * factor,
    per_100g.protein * factor,
    per_100g.carbs * factor,
    per_100g.fat * factor,
  ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
  pub label: String,
  /// 推荐重量 (g)
  pub weight_g: f64,
  /// 推荐热量 (kcal)
  pub calories: f64,
}

/// 按每 100 克热量的比例分配目标热量；没有热量数据的食物推荐 0 克
pub fn plan<'a, I>(items: I, target_calories: f64) -> Result<Vec<PlanEntry>, PlanError>
where
  I: IntoIterator<Item = (&'a str, &'a Nutrition)>,
{
  if !target_calories.is_finite() || target_calories == 0.0 {
    return Err(PlanError::InvalidTarget(target_calories));
  }

  let items: Vec<(&str, &Nutrition)> = items.into_iter().collect();
  let total: f64 = items.iter().map(|(_, n)| n.calories.max(0.0)).sum();
  if total <= 0.0 {
    return Err(PlanError::NoCalories);
  }

  let entries = items
    .into_iter()
    .map(|(label, per_100g)| {
      let base = per_100g.calories.max(0.0);
      if base == 0.0 {
        return PlanEntry {
          label: label.to_string(),
          weight_g: 0.0,
          calories: 0.0,
        };
      }
      let calories = target_calories * base / total;
      PlanEntry {
        label: label.to_string(),
        weight_g: calories / base * BASELINE_GRAMS,
        calories,
      }
    })
    .collect();

  Ok(entries)
}
