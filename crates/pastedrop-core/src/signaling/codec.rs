//! 令牌编解码
//!
//! 令牌格式: `base64url(json || crc32_be(json))`，不带填充。
//! - json: 带 `role` 标签的 `SignalingPayload`
//! - crc32: JSON 字节的校验和，用于发现复制粘贴造成的损坏
//!
//! 输出只包含 URL 安全字符，可以直接放进 URL 片段。
//! 解码是纯函数，不会应用任何描述。

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use crate::signaling::{
    AnswerPayload, DescriptorKind, FileManifest, OfferPayload, SessionDescriptor,
    SignalingPayload, TokenError,
};

/// 编码不带填充，解码时带不带填充都接受
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const CHECKSUM_LEN: usize = 4;

/// 最短的合法载荷: 校验和 + `{}`
const MIN_DECODED_LEN: usize = CHECKSUM_LEN + 2;

/// 编码 offer 令牌
pub fn encode_offer(
    descriptor: &SessionDescriptor,
    manifest: &FileManifest,
) -> Result<String, TokenError> {
    encode(&SignalingPayload::Offer(OfferPayload {
        descriptor: descriptor.clone(),
        manifest: manifest.clone(),
    }))
}

/// 编码 answer 令牌
pub fn encode_answer(descriptor: &SessionDescriptor) -> Result<String, TokenError> {
    encode(&SignalingPayload::Answer(AnswerPayload {
        descriptor: descriptor.clone(),
    }))
}

fn encode(payload: &SignalingPayload) -> Result<String, TokenError> {
    let json = serde_json::to_vec(payload)?;
    let checksum = crc32fast::hash(&json);

    let mut bytes = json;
    bytes.extend_from_slice(&checksum.to_be_bytes());
    Ok(TOKEN_ENGINE.encode(bytes))
}

/// 解码任意令牌
pub fn decode(token: &str) -> Result<SignalingPayload, TokenError> {
    // 复制粘贴时常带入换行和空格
    let compact: String = token.split_whitespace().collect();
    if compact.is_empty() {
        return Err(TokenError::Empty);
    }

    let bytes = TOKEN_ENGINE.decode(compact.as_bytes())?;
    if bytes.len() < MIN_DECODED_LEN {
        return Err(TokenError::TooShort(bytes.len()));
    }

    let (json, checksum_bytes) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(checksum_bytes);
    if u32::from_be_bytes(expected) != crc32fast::hash(json) {
        return Err(TokenError::Checksum);
    }

    let payload: SignalingPayload = serde_json::from_slice(json)?;

    // 描述类型必须与令牌角色一致
    let actual = payload.descriptor().kind;
    if actual != payload.kind() {
        return Err(TokenError::UnexpectedRole {
            expected: payload.kind(),
            actual,
        });
    }

    Ok(payload)
}

/// 解码并要求是 offer 令牌
pub fn decode_offer(token: &str) -> Result<OfferPayload, TokenError> {
    match decode(token)? {
        SignalingPayload::Offer(offer) => Ok(offer),
        SignalingPayload::Answer(_) => Err(TokenError::UnexpectedRole {
            expected: DescriptorKind::Offer,
            actual: DescriptorKind::Answer,
        }),
    }
}

/// 解码并要求是 answer 令牌
pub fn decode_answer(token: &str) -> Result<AnswerPayload, TokenError> {
    match decode(token)? {
        SignalingPayload::Answer(answer) => Ok(answer),
        SignalingPayload::Offer(_) => Err(TokenError::UnexpectedRole {
            expected: DescriptorKind::Answer,
            actual: DescriptorKind::Offer,
        }),
    }
}
