//! 状态模块
//!
//! 提供面向用户的状态级别、状态条目以及状态/进度回调接口。
//! 核心组件不直接访问界面，所有界面效果都经由这里的 trait 传出。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 状态级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error = 0,
    Warn = 1,
    Info = 2,
    Success = 3,
}

impl Severity {
    /// 获取对应的 Emoji 图标
    pub fn icon(&self) -> &'static str {
        match self {
            Severity::Error => "❌",
            Severity::Warn => "⚠️",
            Severity::Info => "ℹ️",
            Severity::Success => "✅",
        }
    }

    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warn => "WARN",
            Severity::Info => "INFO",
            Severity::Success => "SUCCESS",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(Severity::Error),
            "WARN" | "WARNING" => Ok(Severity::Warn),
            "INFO" => Ok(Severity::Info),
            "SUCCESS" | "OK" => Ok(Severity::Success),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 状态条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub severity: Severity,
    pub message: String,
}

impl StatusEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.severity.icon(), self.message)
    }
}

/// 状态回调（协商层使用）
pub trait StatusSink: Send + Sync {
    fn on_status(&self, message: &str, severity: Severity);
}

/// 进度回调（传输层使用），`fraction` 取值 0..=1
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, fraction: f64);
}

/// 丢弃所有状态的空实现
pub struct NullSink;

impl StatusSink for NullSink {
    fn on_status(&self, _message: &str, _severity: Severity) {}
}

impl ProgressSink for NullSink {
    fn on_progress(&self, _fraction: f64) {}
}

/// 格式化字节数，例如 `1.5 KB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    // 最多保留两位小数，并去掉多余的 0
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}
