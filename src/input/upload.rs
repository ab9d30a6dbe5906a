// 该文件是 Shiliao （食疗） 项目的一部分。
// src/input/upload.rs - 上传文件落盘
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const UPLOAD_DIR: &str = "uploads";
const PREDICTION_DIR: &str = "predictions";
const DEFAULT_EXTENSION: &str = "png";
// 无法从内容识别格式时，只接受这些客户端扩展名
const RASTER_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff"];
// image 库可以编码的格式，其余格式的标注图一律输出 PNG
const ENCODABLE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum UploadError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("路径 {0} 不在静态目录下")]
  OutsideRoot(PathBuf),
}

/// 单次请求的文件位置
#[derive(Debug, Clone)]
pub struct StoredUpload {
  pub id: Uuid,
  /// 原始上传文件
  pub input_path: PathBuf,
  /// 标注图输出位置
  pub output_path: PathBuf,
}

/// 上传文件存放在静态目录中，文件名由 UUID 生成，与客户端文件名无关
#[derive(Debug, Clone)]
pub struct UploadStore {
  root: PathBuf,
}

impl UploadStore {
  pub fn new<P: Into<PathBuf>>(root: P) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn store(&self, file_name: Option<&str>, bytes: &[u8]) -> Result<StoredUpload, UploadError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let day = PathBuf::from(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));

    let input_ext = sniffed_extension(bytes)
      .or_else(|| file_name.and_then(extension_of))
      .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let output_ext = if ENCODABLE_EXTENSIONS.contains(&input_ext.as_str()) {
      input_ext.clone()
    } else {
      DEFAULT_EXTENSION.to_string()
    };

    let input_dir = self.root.join(UPLOAD_DIR).join(&day);
    let output_dir = self.root.join(PREDICTION_DIR).join(&day);
    std::fs::create_dir_all(&input_dir)?;
    std::fs::create_dir_all(&output_dir)?;

    let input_path = input_dir.join(format!("{}.{}", id, input_ext));
    let output_path = output_dir.join(format!("{}.{}", id, output_ext));
    std::fs::write(&input_path, bytes)?;
    debug!(
      "保存上传文件 {:?} ({} 字节) 到 {}",
      file_name,
      bytes.len(),
      input_path.display()
    );

    Ok(StoredUpload {
      id,
      input_path,
      output_path,
    })
  }

  /// 删除请求失败时留下的文件
  pub fn discard(&self, stored: &StoredUpload) {
    for path in [&stored.input_path, &stored.output_path] {
      match std::fs::remove_file(path) {
        Ok(()) => debug!("删除文件 {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("无法删除文件 {}: {}", path.display(), e),
      }
    }
  }

  /// 将静态目录中的文件路径转换为 `/static/...` 形式的访问路径
  pub fn public_path(&self, path: &Path) -> Result<String, UploadError> {
    let relative = path
      .strip_prefix(&self.root)
      .map_err(|_| UploadError::OutsideRoot(path.to_path_buf()))?;
    let parts: Vec<String> = relative
      .components()
      .map(|c| c.as_os_str().to_string_lossy().into_owned())
      .collect();
    Ok(format!("/static/{}", parts.join("/")))
  }
}

// 按文件内容识别的图像格式决定扩展名
fn sniffed_extension(bytes: &[u8]) -> Option<String> {
  let format = image::guess_format(bytes).ok()?;
  format.extensions_str().first().map(|ext| ext.to_string())
}

fn extension_of(file_name: &str) -> Option<String> {
  let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
  RASTER_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_writes_bytes_under_unique_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = UploadStore::new(dir.path());

    let a = store.store(Some("lunch.jpg"), b"first").unwrap();
    let b = store.store(Some("lunch.jpg"), b"second").unwrap();

    assert_ne!(a.id, b.id);
    assert_ne!(a.input_path, b.input_path);
    assert_ne!(a.output_path, b.output_path);
    assert_eq!(std::fs::read(&a.input_path).unwrap(), b"first");
    assert_eq!(std::fs::read(&b.input_path).unwrap(), b"second");
    assert!(a.input_path.starts_with(dir.path().join(UPLOAD_DIR)));
    assert!(a.output_path.starts_with(dir.path().join(PREDICTION_DIR)));
  }

  #[test]
  fn test_store_extension_handling() {
    let dir = tempfile::tempdir().unwrap();
    let store = UploadStore::new(dir.path());

    let jpeg = store.store(Some("Thali.JPEG"), b"x").unwrap();
    assert_eq!(jpeg.input_path.extension().unwrap(), "jpeg");
    assert_eq!(jpeg.output_path.extension().unwrap(), "jpeg");

    let webp = store.store(Some("plate.webp"), b"x").unwrap();
    assert_eq!(webp.input_path.extension().unwrap(), "webp");
    assert_eq!(webp.output_path.extension().unwrap(), "png");

    let none = store.store(None, b"x").unwrap();
    assert_eq!(none.input_path.extension().unwrap(), "png");

    let odd = store.store(Some("../../etc/passwd"), b"x").unwrap();
    assert!(odd.input_path.starts_with(dir.path()));
    assert_eq!(odd.input_path.extension().unwrap(), "png");
  }

  fn png_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    image::RgbImage::new(4, 4)
      .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    bytes
  }

  #[test]
  fn test_store_names_file_after_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = UploadStore::new(dir.path());

    // 有效 PNG 后面附加脚本，仍以 PNG 保存
    let mut payload = png_bytes();
    payload.extend_from_slice(b"<script>alert(1)</script>");
    let html = store.store(Some("evil.html"), &payload).unwrap();
    assert_eq!(html.input_path.extension().unwrap(), "png");
    assert_eq!(html.output_path.extension().unwrap(), "png");

    let renamed = store.store(Some("photo.jpg"), &png_bytes()).unwrap();
    assert_eq!(renamed.input_path.extension().unwrap(), "png");

    for name in ["evil.html", "icon.svg", "app.js", "page.htm"] {
      let stored = store.store(Some(name), b"<html></html>").unwrap();
      assert_eq!(stored.input_path.extension().unwrap(), "png", "{name}");
    }
  }

  #[test]
  fn test_discard_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = UploadStore::new(dir.path());
    let stored = store.store(Some("dal.png"), b"x").unwrap();
    std::fs::write(&stored.output_path, b"y").unwrap();

    store.discard(&stored);
    assert!(!stored.input_path.exists());
    assert!(!stored.output_path.exists());

    // 文件已不存在时不报错
    store.discard(&stored);
  }

  #[test]
  fn test_public_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = UploadStore::new(dir.path());
    let stored = store.store(Some("dal.png"), b"x").unwrap();

    let public = store.public_path(&stored.output_path).unwrap();
    assert!(public.starts_with("/static/predictions/"));
    assert!(public.ends_with(&format!("{}.png", stored.id)));
    assert!(!public.contains('\\'));

    assert!(matches!(
      store.public_path(Path::new("/elsewhere/a.png")),
      Err(UploadError::OutsideRoot(_))
    ));
  }
}
