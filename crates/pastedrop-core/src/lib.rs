//! PasteDrop Core Library
//!
//! 无需服务器的点对点文件传输: 双方通过复制粘贴（或分享链接）交换
//! 一次性令牌完成连接协商，之后文件经数据通道直接传输。
//!
//! # 模块
//!
//! - **signaling**: 令牌编码/解码、分享链接
//! - **negotiator**: 连接协商状态机、重试与排查说明
//! - **transfer**: 分块发送、拼接与保存
//! - **diagnostics**: 候选错误统计与连通性提示
//! - **transport**: 传输层接口以及进程内回环实现
//! - **workflow**: 发送/接收会话的高层封装
//!
//! # 使用示例
//!
//! ## 发送文件
//!
//! ```ignore
//! use pastedrop_core::{SendOptions, SendSession, SimpleSendCallback, MemoryNetwork};
//!
//! let (callback, mut events) = SimpleSendCallback::new();
//! let mut session = SendSession::new(network, SendOptions::default(), Arc::new(callback));
//!
//! // 1. 生成 offer 链接，交给接收方
//! let share = session.offer(Path::new("photo.jpg")).await?;
//! println!("{}", share.shareable());
//!
//! // 2. 粘贴接收方回传的 answer
//! session.accept_answer(&answer_link).await?;
//!
//! // 3. 等待连接并发送
//! let summary = session.run().await?;
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! use pastedrop_core::{DirectoryPersistence, ReceiveOptions, ReceiveSession, SimpleReceiveCallback};
//!
//! let (callback, mut events) = SimpleReceiveCallback::new();
//! let persistence = Arc::new(DirectoryPersistence::new(download_dir));
//! let mut session = ReceiveSession::new(network, ReceiveOptions::default(), persistence, Arc::new(callback));
//!
//! // 1. 打开 offer 链接，得到 answer 回传链接
//! let answer = session.accept_offer(&offer_link).await?;
//!
//! // 2. 接收并保存
//! let path = session.run().await?;
//! ```

pub mod config;
pub mod diagnostics;
pub mod negotiator;
pub mod signaling;
pub mod status;
pub mod transfer;
pub mod transport;
pub mod workflow;

// Signaling re-exports
pub use signaling::{
    AnswerPayload, DescriptorKind, FileManifest, OfferPayload, SessionDescriptor,
    SignalingPayload, TokenError, parse_link,
};

// Negotiator re-exports
pub use negotiator::{
    AnswerDisposition, Negotiator, NegotiatorError, NegotiatorEvent, NegotiatorState,
};

// Transfer re-exports
pub use transfer::{DirectoryPersistence, Persistence, TransferError};

// Transport re-exports
pub use transport::{FaultPlan, MemoryNetwork, Role, Transport, TransportFactory};

// Status re-exports
pub use status::{Severity, StatusEntry};

// Workflow re-exports
pub use workflow::{
    ReceiveEvent, ReceiveOptions, ReceiveProgressCallback, ReceiveSession, SendEvent,
    SendOptions, SendProgressCallback, SendSession, ShareToken, SimpleReceiveCallback,
    SimpleSendCallback,
};
