//! 连接失败后的排查说明

use crate::config::TransportConfig;

const CAUSES: &[&str] = &[
    "当前网络阻止点对点连接（公司、学校网络中很常见）",
    "双方都位于严格的防火墙或 NAT 之后",
    "移动热点或运营商限制",
    "TURN 中继服务器不可用或负载过高",
];

const REMEDIES: &[&str] = &[
    "同一网络: 让两台设备连接同一个 WiFi",
    "移动热点: 一方开启热点，另一方连接",
    "家庭网络: 通常比办公或学校网络更容易成功",
    "再试一次: 有时第二次就能连上",
];

/// 生成排查说明，附带最后一次尝试使用的中继服务器
pub fn troubleshooting_guide(last_config: Option<&TransportConfig>) -> String {
    let mut text = String::from("连接失败: 网络限制\n\n可能的原因:\n");
    for cause in CAUSES {
        text.push_str("  - ");
        text.push_str(cause);
        text.push('\n');
    }

    text.push_str("\n可以尝试:\n");
    for remedy in REMEDIES {
        text.push_str("  - ");
        text.push_str(remedy);
        text.push('\n');
    }

    let relays: Vec<&str> = last_config
        .map(TransportConfig::relay_servers)
        .unwrap_or_default()
        .into_iter()
        .flat_map(|server| server.urls.iter().map(String::as_str))
        .collect();
    if !relays.is_empty() {
        text.push_str("\n已尝试的中继服务器:\n");
        for url in relays {
            text.push_str("  - ");
            text.push_str(url);
            text.push('\n');
        }
    }

    text.push_str("\n点对点文件传输需要设备之间直接连接，部分网络出于安全考虑会加以限制。");
    text
}
