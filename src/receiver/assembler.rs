// 分片合并
//
// 按序号 1..=total 依次把分片文件追加到目标文件，全部成功后删除会话目录。
// 失败时目标文件和会话目录都保留，由调用方检查

use crate::error::{Result, UploadError};
use crate::receiver::registry::chunk_file_name;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// 合并分片，返回目标文件大小
pub async fn assemble(target: &Path, chunk_dir: &Path, chunks_total: u64) -> Result<u64> {
    if chunks_total == 0 {
        return Err(UploadError::assembly(chunk_dir, "总分片数为 0"));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let output = File::create(target)
        .await
        .map_err(|e| UploadError::assembly(target, format!("创建目标文件失败: {}", e)))?;
    let mut writer = BufWriter::new(output);
    let mut total_bytes = 0u64;

    for chunk_number in 1..=chunks_total {
        let chunk_path = chunk_dir.join(chunk_file_name(chunk_number));
        let mut chunk = File::open(&chunk_path)
            .await
            .map_err(|e| UploadError::assembly(&chunk_path, format!("打开分片失败: {}", e)))?;

        let copied = tokio::io::copy(&mut chunk, &mut writer)
            .await
            .map_err(|e| UploadError::assembly(&chunk_path, format!("复制分片失败: {}", e)))?;

        // 空分片只可能出现在空文件的唯一分片上
        if copied == 0 && chunks_total > 1 {
            return Err(UploadError::assembly(&chunk_path, "分片为空"));
        }

        debug!("合并分片 #{}/{}: {} bytes", chunk_number, chunks_total, copied);
        total_bytes += copied;
    }

    writer
        .flush()
        .await
        .map_err(|e| UploadError::assembly(target, format!("写入目标文件失败: {}", e)))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| UploadError::assembly(target, format!("同步目标文件失败: {}", e)))?;

    if let Err(e) = fs::remove_dir_all(chunk_dir).await {
        // 合并结果已经完整，目录残留交给过期清理
        warn!("删除分片目录失败: {:?}, 错误: {}", chunk_dir, e);
    }

    info!(
        "✓ 合并完成: {:?} ({} 个分片, {} bytes)",
        target, chunks_total, total_bytes
    );
    Ok(total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn write_chunks(dir: &Path, content: &[u8], chunk_size: usize) -> u64 {
        std::fs::create_dir_all(dir).unwrap();
        let mut total = 0;
        for (i, chunk) in content.chunks(chunk_size).enumerate() {
            std::fs::write(dir.join((i + 1).to_string()), chunk).unwrap();
            total += 1;
        }
        total
    }

    #[tokio::test]
    async fn test_assemble_reproduces_original() {
        let root = TempDir::new().unwrap();
        let chunk_dir = root.path().join("session");
        let content: Vec<u8> = (0..250u32).map(|i| (i * 7 % 256) as u8).collect();

        let total = write_chunks(&chunk_dir, &content, 100);
        assert_eq!(total, 3);
        assert_eq!(std::fs::read(chunk_dir.join("3")).unwrap().len(), 50);

        let target = root.path().join("out").join("file.bin");
        let size = assemble(&target, &chunk_dir, total).await.unwrap();

        assert_eq!(size, 250);
        assert_eq!(std::fs::read(&target).unwrap(), content);
        assert!(!chunk_dir.exists());
    }

    #[tokio::test]
    async fn test_missing_chunk_keeps_state() {
        let root = TempDir::new().unwrap();
        let chunk_dir = root.path().join("session");
        let total = write_chunks(&chunk_dir, &[1u8; 300], 100);
        std::fs::remove_file(chunk_dir.join("2")).unwrap();

        let target = root.path().join("file.bin");
        let err = assemble(&target, &chunk_dir, total).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Assembly);
        assert!(err.to_string().contains('2'));
        assert!(chunk_dir.join("1").exists());
    }

    #[tokio::test]
    async fn test_empty_chunk_is_an_error() {
        let root = TempDir::new().unwrap();
        let chunk_dir = root.path().join("session");
        write_chunks(&chunk_dir, &[1u8; 200], 100);
        std::fs::write(chunk_dir.join("2"), b"").unwrap();

        let err = assemble(&root.path().join("f"), &chunk_dir, 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Assembly);
    }
}
