// 扩展名白名单 / 黑名单检查
//
// 白名单为空表示允许所有扩展名；黑名单优先于白名单

use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};

/// 扩展名过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionFilter {
    /// 允许的扩展名（为空表示全部允许）
    #[serde(default)]
    pub allowed: Vec<String>,
    /// 禁止的扩展名
    #[serde(default)]
    pub blocked: Vec<String>,
}

impl ExtensionFilter {
    pub fn new(allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self { allowed, blocked }
    }

    /// 检查文件名的扩展名是否被允许
    pub fn check(&self, file_name: &str) -> Result<()> {
        let ext = extension_of(file_name).unwrap_or_default();

        if self.blocked.iter().any(|b| normalize(b) == ext) {
            return Err(UploadError::validation(format!(
                "禁止上传的扩展名: {:?}",
                ext
            )));
        }

        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| normalize(a) == ext) {
            return Err(UploadError::validation(format!(
                "扩展名不在允许列表中: {:?}",
                ext
            )));
        }

        Ok(())
    }
}

fn normalize(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// 提取文件扩展名（小写，仅保留 ASCII 字母数字）
///
/// 没有扩展名或过滤后为空时返回 None
pub fn extension_of(file_name: &str) -> Option<String> {
    // 兼容带路径的文件名
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() {
        // ".bashrc" 这类隐藏文件不算扩展名
        return None;
    }
    let ext: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}
