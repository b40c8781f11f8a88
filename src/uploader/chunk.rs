// 上传分片规划
//
// 分片规则：
// - 分片序号从 1 开始，最后一个分片的序号等于总分片数
// - 最后一个分片按文件大小截断（可能小于分片大小）
// - 总分片数 == 1 的会话不走分片协议，直接整体上传

use crate::error::{Result, UploadError};
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认分片大小: 10MB
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 分片描述（仅客户端本地使用，不持久化）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片序号（1..=total_chunks）
    pub index: usize,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
}

impl ChunkDescriptor {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    ///
    /// # 参数
    /// * `file_path` - 本地文件路径
    pub async fn read_data(&self, file_path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(file_path).await?;

        // 定位到分片起始位置
        file.seek(std::io::SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 计算总分片数: ceil(file_size / chunk_size)，空文件按 1 个分片处理
pub fn total_chunks(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size).max(1) as usize
}

/// 规划分片
///
/// 纯函数，相同输入总是得到相同输出。`chunk_size` 必须大于 0
pub fn plan(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>> {
    if chunk_size == 0 {
        return Err(UploadError::validation("分片大小必须大于 0"));
    }

    // 空文件：单个空分片
    if file_size == 0 {
        return Ok(vec![ChunkDescriptor::new(1, 0..0)]);
    }

    let mut chunks = Vec::with_capacity(total_chunks(file_size, chunk_size));
    let mut offset = 0u64;
    let mut index = 1;

    while offset < file_size {
        let end = offset.saturating_add(chunk_size).min(file_size);
        chunks.push(ChunkDescriptor::new(index, offset..end));
        offset = end;
        index += 1;
    }

    Ok(chunks)
}
