//! 离线信令模块
//!
//! 双方在建立直连之前无法通信，所以连接描述和文件信息被编码成
//! 可复制粘贴、可放入 URL 片段的令牌，通过带外方式交换。
//!
//! - `codec`: 令牌编码/解码
//! - `link`: 分享链接的构造与解析

pub mod codec;
pub mod link;

pub use codec::{decode, decode_answer, decode_offer, encode_answer, encode_offer};
pub use link::{answer_link, extract_token, offer_link, parse_link};

use serde::{Deserialize, Serialize};

/// 描述类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl std::fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorKind::Offer => write!(f, "offer"),
            DescriptorKind::Answer => write!(f, "answer"),
        }
    }
}

/// 传输层生成的连接描述，对本模块不透明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    pub sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// 文件信息，随 offer 一起发送
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifest {
    pub name: String,
    pub size: u64,
    /// 可能为空字符串
    #[serde(default)]
    pub mime_type: String,
}

impl FileManifest {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }

    /// 用于保存时的 MIME 类型，空值回退到 `application/octet-stream`
    pub fn effective_mime_type(&self) -> &str {
        if self.mime_type.is_empty() {
            "application/octet-stream"
        } else {
            &self.mime_type
        }
    }
}

/// offer 令牌内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub descriptor: SessionDescriptor,
    pub manifest: FileManifest,
}

/// answer 令牌内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub descriptor: SessionDescriptor,
}

/// 解码后的令牌，由 `role` 字段区分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum SignalingPayload {
    Offer(OfferPayload),
    Answer(AnswerPayload),
}

impl SignalingPayload {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            SignalingPayload::Offer(_) => DescriptorKind::Offer,
            SignalingPayload::Answer(_) => DescriptorKind::Answer,
        }
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        match self {
            SignalingPayload::Offer(p) => &p.descriptor,
            SignalingPayload::Answer(p) => &p.descriptor,
        }
    }
}

/// 令牌格式错误（可恢复，需要用户重新提供）
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Malformed token: empty input")]
    Empty,

    #[error("Malformed token: invalid encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Malformed token: too short ({0} bytes)")]
    TooShort(usize),

    #[error("Malformed token: checksum mismatch, the code may have been corrupted during copy/paste")]
    Checksum,

    #[error("Malformed token: invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed token: expected {expected} token, got {actual}")]
    UnexpectedRole {
        expected: DescriptorKind,
        actual: DescriptorKind,
    },

    #[error("Malformed token: invalid share link: {0}")]
    Link(String),
}
