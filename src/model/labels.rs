// 该文件是 Shiliao （食疗） 项目的一部分。
// src/model/labels.rs - 类别名称表
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

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

// 元数据中允许的最大类别编号
const MAX_CLASS_ID: usize = 4095;

#[derive(Error, Debug)]
pub enum LabelsError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件格式错误: {0}")]
  ParseError(#[from] toml::de::Error),
}

/// 标签文件格式: `names = ["Biryani", "Shahi Paneer", ...]`，下标即类别编号
#[derive(Debug, Deserialize)]
struct LabelsFile {
  names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  pub fn new(names: Vec<String>) -> Self {
    Self { names }
  }

  pub fn from_toml_file(path: &Path) -> Result<Self, LabelsError> {
    info!("加载标签文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    let file: LabelsFile = toml::from_str(&content)?;
    Ok(Self::new(file.names))
  }

  /// 解析导出模型时写入的 `names` 元数据，例如 `{0: 'Biryani', 1: 'Dal'}`
  pub fn from_metadata(value: &str) -> Option<Self> {
    let body = value.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut pairs = Vec::new();
    let mut rest = body.trim();

    while !rest.is_empty() {
      let (id, after_id) = rest.split_once(':')?;
      let id: usize = id.trim().parse().ok()?;
      if id > MAX_CLASS_ID {
        return None;
      }
      let after_id = after_id.trim_start();
      let quote = after_id.chars().next().filter(|c| *c == '\'' || *c == '"')?;
      let after_quote = &after_id[1..];
      let end = after_quote.find(quote)?;
      pairs.push((id, after_quote[..end].to_string()));

      rest = after_quote[end + 1..].trim_start();
      rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }

    let len = pairs.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
    let mut names: Vec<String> = (0..len).map(|id| format!("class_{}", id)).collect();
    for (id, name) in pairs {
      names[id] = name;
    }
    Some(Self::new(names))
  }

  pub fn name(&self, class_id: u32) -> String {
    self
      .names
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| format!("class_{}", class_id))
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}
