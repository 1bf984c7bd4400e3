//! 应用配置和持久化
//!
//! 提供传输服务器列表、分块大小、重试策略等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// 默认分块大小 (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// 候选地址收集策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    #[default]
    All,
    Relay,
}

/// 媒体捆绑策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// 单个 STUN/TURN 服务器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(urls: &[&str], username: &str, credential: &str) -> Self {
        Self {
            urls: urls.iter().map(|u| (*u).to_string()).collect(),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// 是否为中继 (TURN) 服务器
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// 传输层配置（交给外部传输实现）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 配置名称，仅用于日志和诊断
    pub label: String,
    pub ice_servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
    #[serde(default)]
    pub transport_policy: TransportPolicy,
    #[serde(default)]
    pub bundle_policy: BundlePolicy,
}

impl TransportConfig {
    /// 主配置：多个 STUN + 两组 TURN 中继
    pub fn primary() -> Self {
        Self {
            label: "primary".to_string(),
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun.cloudflare.com:3478"),
                IceServer::turn(
                    &[
                        "turn:turn.bistri.com:80",
                        "turn:turn.bistri.com:443",
                        "turn:turn.bistri.com:443?transport=tcp",
                    ],
                    "bismuth",
                    "bismuth",
                ),
                IceServer::turn(
                    &[
                        "turn:numb.viagenie.ca:3478",
                        "turn:numb.viagenie.ca:3478?transport=tcp",
                    ],
                    "webrtc@live.com",
                    "muazkh",
                ),
            ],
            candidate_pool_size: 10,
            transport_policy: TransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
        }
    }

    /// 备用配置：更少的收集资源，只保留另一组中继
    pub fn fallback() -> Self {
        Self {
            label: "fallback".to_string(),
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::turn(
                    &[
                        "turn:numb.viagenie.ca:3478",
                        "turn:numb.viagenie.ca:3478?transport=tcp",
                    ],
                    "webrtc@live.com",
                    "muazkh",
                ),
            ],
            candidate_pool_size: 5,
            transport_policy: TransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
        }
    }

    /// 所有服务器 URL（展开多 URL 条目）
    pub fn server_urls(&self) -> impl Iterator<Item = &str> {
        self.ice_servers
            .iter()
            .flat_map(|s| s.urls.iter().map(String::as_str))
    }

    /// 中继服务器列表，用于故障排查输出
    pub fn relay_servers(&self) -> Vec<&IceServer> {
        self.ice_servers.iter().filter(|s| s.is_relay()).collect()
    }
}

/// 协商阶段的运行参数
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    /// 按顺序尝试的传输配置，第 0 项为主配置
    pub ladder: Vec<TransportConfig>,
    pub gathering_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_attempts: u32,
    pub warn_threshold: usize,
}

impl NegotiationSettings {
    /// 第 `attempt` 次连接（从 0 开始）使用的配置；超出列表时停留在最后一项，
    /// 列表为空时返回 `None`
    pub fn config_for_attempt(&self, attempt: u32) -> Option<&TransportConfig> {
        let index = (attempt as usize).min(self.ladder.len().saturating_sub(1));
        self.ladder.get(index)
    }

    /// 字段是公开的，使用前需要检查
    pub fn validate(&self) -> Result<(), String> {
        if self.ladder.is_empty() {
            return Err("at least one transport configuration is required".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Settings::default().negotiation()
    }
}

/// 传输阶段的运行参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 接收文件的保存目录
    pub download_dir: PathBuf,
    /// 分享链接所基于的页面地址
    pub share_base_url: String,
    /// 分块大小 (字节)
    pub chunk_size: usize,
    /// 候选收集超时 (秒)
    pub gathering_timeout_secs: u64,
    /// 连接失败后的重试间隔 (毫秒)
    pub retry_backoff_ms: u64,
    /// 最大连接尝试次数
    pub max_connection_attempts: u32,
    /// 候选错误达到该数量时提示用户
    pub candidate_warn_threshold: usize,
    /// 详细日志模式
    pub verbose: bool,
    /// 传输配置列表（主配置在前）
    pub transports: Vec<TransportConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            share_base_url: "http://localhost:8080/".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            gathering_timeout_secs: 10,
            retry_backoff_ms: 2000,
            max_connection_attempts: 3,
            candidate_warn_threshold: 4,
            verbose: false,
            transports: vec![TransportConfig::primary(), TransportConfig::fallback()],
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pastedrop");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str::<Settings>(&content) {
                    Ok(settings) => match settings.validate() {
                        Ok(()) => {
                            debug!("Loaded settings from {:?}", path);
                            return settings;
                        }
                        Err(e) => {
                            log::warn!("Invalid settings: {}, using defaults", e);
                        }
                    },
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.transports.is_empty() {
            anyhow::bail!("at least one transport configuration is required");
        }
        if self.max_connection_attempts == 0 {
            anyhow::bail!("max_connection_attempts must be at least 1");
        }
        Ok(())
    }

    /// 协商参数
    pub fn negotiation(&self) -> NegotiationSettings {
        NegotiationSettings {
            ladder: self.transports.clone(),
            gathering_timeout: Duration::from_secs(self.gathering_timeout_secs),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_attempts: self.max_connection_attempts,
            warn_threshold: self.candidate_warn_threshold,
        }
    }

    pub fn transfer(&self) -> TransferSettings {
        TransferSettings {
            chunk_size: self.chunk_size,
        }
    }
}
