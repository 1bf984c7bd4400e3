//! 工作流模块
//!
//! 提供高层 API 封装完整的发送/接收流程。令牌的交换方式（复制粘贴、
//! 聊天软件、二维码）由调用方决定，这里只负责生成和消费。

pub mod receiver;
pub mod sender;

pub use receiver::{
    ReceiveEvent, ReceiveOptions, ReceiveProgressCallback, ReceiveSession, SimpleReceiveCallback,
};
pub use sender::{
    PreparedFile, SendEvent, SendOptions, SendProgressCallback, SendSession, SimpleSendCallback,
    prepare_file,
};

use log::warn;
use tokio::sync::mpsc;

use crate::signaling::{DescriptorKind, answer_link, offer_link};

/// 带外令牌收件箱容量；令牌由人工转交，数量很少
const INBOX_CAPACITY: usize = 8;

/// 需要交给对方的令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareToken {
    pub kind: DescriptorKind,
    pub token: String,
    /// 分享链接；基础地址无效时为 `None`
    pub link: Option<String>,
}

impl ShareToken {
    pub fn offer(base: &str, token: String) -> Self {
        let link = offer_link(base, &token)
            .map_err(|e| warn!("Cannot build offer link from '{}': {}", base, e))
            .ok()
            .map(String::from);
        Self {
            kind: DescriptorKind::Offer,
            token,
            link,
        }
    }

    pub fn answer(base: &str, token: String) -> Self {
        let link = answer_link(base, &token)
            .map_err(|e| warn!("Cannot build answer link from '{}': {}", base, e))
            .ok()
            .map(String::from);
        Self {
            kind: DescriptorKind::Answer,
            token,
            link,
        }
    }

    /// 交给用户的文本，优先使用链接
    pub fn shareable(&self) -> &str {
        self.link.as_deref().unwrap_or(&self.token)
    }
}

fn token_inbox() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(INBOX_CAPACITY)
}
