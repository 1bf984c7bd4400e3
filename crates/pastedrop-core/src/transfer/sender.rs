//! 发送端
//!
//! 一次只有一个分块在途: 读取、发送、成功后让出调度再发下一块。
//! 任一分块失败即中止，不在分块级别重试。

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::status::ProgressSink;
use crate::transfer::TransferError;
use crate::transport::DataChannel;

/// 分块计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub size: u64,
    pub chunk_size: usize,
}

impl ChunkPlan {
    pub fn new(size: u64, chunk_size: usize) -> Self {
        Self {
            size,
            chunk_size: chunk_size.max(1),
        }
    }

    /// 分块总数 = ceil(size / chunk_size)
    pub fn total_chunks(&self) -> usize {
        self.size.div_ceil(self.chunk_size as u64) as usize
    }

    /// 第 `index` 块的长度，最后一块可能更短
    pub fn chunk_len(&self, index: usize) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        if start >= self.size {
            return 0;
        }
        (self.size - start).min(self.chunk_size as u64) as usize
    }

    /// 已完成 `completed` 块时的进度，封顶 1.0
    pub fn fraction(&self, completed: usize) -> f64 {
        let total = self.total_chunks();
        if total == 0 {
            return 1.0;
        }
        (completed as f64 / total as f64).min(1.0)
    }
}

/// 发送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub chunks: usize,
    pub bytes: u64,
}

/// 从 `reader` 读取并按计划顺序发送全部分块
pub async fn stream_chunks<R, C>(
    reader: &mut R,
    plan: ChunkPlan,
    channel: &C,
    progress: &dyn ProgressSink,
) -> Result<SendSummary, TransferError>
where
    R: AsyncRead + Unpin + Send,
    C: DataChannel + ?Sized,
{
    let total = plan.total_chunks();
    info!(
        "Streaming {} bytes in {} chunks of {}",
        plan.size, total, plan.chunk_size
    );

    let mut bytes = 0u64;
    for index in 0..total {
        let mut chunk = vec![0u8; plan.chunk_len(index)];
        reader.read_exact(&mut chunk).await?;
        let len = chunk.len() as u64;

        if let Err(source) = channel.send(chunk).await {
            error!("Chunk {}/{} failed: {}", index + 1, total, source);
            return Err(TransferError::ChunkSendFailed { index, source });
        }

        bytes += len;
        progress.on_progress(plan.fraction(index + 1));
        debug!("Sent chunk {}/{} ({} bytes)", index + 1, total, len);

        tokio::task::yield_now().await;
    }

    if total == 0 {
        progress.on_progress(1.0);
    }

    info!("All {} chunks sent ({} bytes)", total, bytes);
    Ok(SendSummary {
        chunks: total,
        bytes,
    })
}
