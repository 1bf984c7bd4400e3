//! 传输层接口
//!
//! 真正的点对点传输（NAT 穿透、候选协商、加密）不在本库内实现，
//! 这里只定义协商层和传输层之间的边界:
//!
//! - `Transport`: 生成/应用连接描述、关闭连接
//! - `DataChannel`: 可靠有序的消息通道
//! - `TransportEvent`: 传输层异步上报的事件，以 mpsc 流的形式交给协商层
//!
//! `memory` 子模块提供进程内的回环实现，用于测试和演示。

pub mod memory;

pub use memory::{FaultPlan, MemoryNetwork, MemoryTransport};

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::signaling::SessionDescriptor;

/// 本端角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// 传输层上报的连通性状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
}

/// 单个候选收集失败（通常是 STUN/TURN 服务器不可达）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateError {
    pub source_url: String,
    pub code: u16,
    pub text: String,
}

/// 传输事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 本地候选收集完成
    GatheringComplete,
    Connectivity(ConnectivityState),
    CandidateError(CandidateError),
    /// 数据通道已打开
    ChannelOpen,
    /// 收到对端消息
    Message(Vec<u8>),
    ChannelClosed,
}

/// 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Invalid session descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// 可靠有序的消息通道
#[async_trait::async_trait]
pub trait DataChannel: Send + Sync {
    /// 发送一条消息，返回时消息已交给传输层
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;
}

/// 一个传输实例
#[async_trait::async_trait]
pub trait Transport: DataChannel {
    /// 生成本地描述并开始收集候选；收集进度通过 `TransportEvent` 上报
    async fn request_local_descriptor(&self) -> Result<SessionDescriptor, TransportError>;

    /// 当前本地描述，包含到目前为止收集到的候选
    async fn local_descriptor(&self) -> Option<SessionDescriptor>;

    async fn apply_remote_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), TransportError>;

    /// 关闭并释放资源，可重复调用
    async fn close(&self);
}

/// 新建传输的返回值: 传输实例 + 该实例专属的事件流
///
/// 事件流随实例一起丢弃，旧实例的事件不会进入新实例。
pub struct TransportHandle<T> {
    pub transport: Arc<T>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// 传输工厂
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: Transport + 'static;

    async fn create(
        &self,
        role: Role,
        config: &TransportConfig,
    ) -> Result<TransportHandle<Self::Transport>, TransportError>;
}
