//! 分享链接
//!
//! - offer 链接: `<base>#<offer 令牌>`
//! - answer 回传链接: `<base>#answer=<answer 令牌>`
//!
//! 解析时既接受完整链接，也接受裸令牌。

use url::{Url, form_urlencoded};

use crate::signaling::{SignalingPayload, TokenError, codec};

/// answer 回传链接中的参数名
const ANSWER_KEY: &str = "answer";

/// 构造 offer 分享链接
pub fn offer_link(base: &str, token: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.set_fragment(Some(token));
    Ok(url)
}

/// 构造 answer 回传链接，令牌经过百分号编码
pub fn answer_link(base: &str, token: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    let fragment = form_urlencoded::Serializer::new(String::new())
        .append_pair(ANSWER_KEY, token)
        .finish();
    url.set_fragment(Some(&fragment));
    Ok(url)
}

/// 从链接或裸令牌中取出令牌文本
pub fn extract_token(input: &str) -> Result<String, TokenError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TokenError::Empty);
    }

    let fragment = match Url::parse(input) {
        Ok(url) => match url.fragment() {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => return Err(TokenError::Link("link has no token fragment".to_string())),
        },
        Err(_) => input.trim_start_matches('#').to_string(),
    };

    // 带填充的令牌本身也可能含有 `=`，只认 answer 参数
    if let Some((_, token)) = form_urlencoded::parse(fragment.as_bytes())
        .find(|(key, _)| key == ANSWER_KEY)
    {
        if token.trim().is_empty() {
            return Err(TokenError::Link("empty answer parameter".to_string()));
        }
        return Ok(token.into_owned());
    }

    Ok(fragment)
}

/// 解析链接或裸令牌并解码
pub fn parse_link(input: &str) -> Result<SignalingPayload, TokenError> {
    codec::decode(&extract_token(input)?)
}
