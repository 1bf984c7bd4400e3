//! 文件传输模块
//!
//! 数据通道打开后，文件按固定大小分块顺序发送，接收端按到达顺序拼接。
//! 通道本身保证可靠有序，这里不做序号校验。
//!
//! - `sender`: 分块计划与顺序发送
//! - `receiver`: 拼接、完成判定与持久化

pub mod receiver;
pub mod sender;

pub use receiver::{DirectoryPersistence, Persistence, Reassembler, ReceivedFile, TransferState};
pub use sender::{ChunkPlan, SendSummary, stream_chunks};

use crate::transport::TransportError;

/// 传输错误
///
/// 传输开始后没有断点续传，任何错误都会结束本次会话。
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Failed to send chunk {index}: {source}")]
    ChunkSendFailed {
        index: usize,
        #[source]
        source: TransportError,
    },

    #[error("Failed to finalize received file: {0}")]
    FinalizeError(#[source] anyhow::Error),

    #[error("Failed to read source file: {0}")]
    Read(#[from] std::io::Error),
}
