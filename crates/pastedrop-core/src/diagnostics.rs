//! 连通性诊断
//!
//! 记录传输层上报的候选收集失败。失败数首次达到阈值时给出一次提示，
//! 之后不再重复。只做观察，不影响协商状态。

use log::{debug, warn};
use std::time::SystemTime;

use crate::transport::CandidateError;

/// 一条候选失败记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub source_url: String,
    pub code: u16,
    pub text: String,
    pub timestamp: SystemTime,
}

/// 面向用户的连通性提示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub failure_count: usize,
    pub message: String,
}

impl Advisory {
    fn limited_connectivity(failure_count: usize) -> Self {
        Self {
            failure_count,
            message: "网络连通性受限: 双方连接同一 WiFi 时效果最好，公司防火墙可能阻止跨网络连接"
                .to_string(),
        }
    }
}

/// 候选失败统计
#[derive(Debug)]
pub struct DiagnosticsTracker {
    failures: Vec<CandidateFailure>,
    threshold: usize,
    warned: bool,
}

impl DiagnosticsTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            failures: Vec::new(),
            threshold,
            warned: false,
        }
    }

    /// 记录一次失败；首次达到阈值时返回提示
    pub fn record_failure(
        &mut self,
        source_url: impl Into<String>,
        code: u16,
        text: impl Into<String>,
    ) -> Option<Advisory> {
        let failure = CandidateFailure {
            source_url: source_url.into(),
            code,
            text: text.into(),
            timestamp: SystemTime::now(),
        };
        debug!(
            "Candidate failure #{}: {} ({} {})",
            self.failures.len() + 1,
            failure.source_url,
            failure.code,
            failure.text
        );
        self.failures.push(failure);

        if self.warned || self.failures.len() < self.threshold {
            return None;
        }

        self.warned = true;
        warn!(
            "{} candidate failures, connectivity is likely limited to the local network",
            self.failures.len()
        );
        Some(Advisory::limited_connectivity(self.failures.len()))
    }

    pub fn record(&mut self, error: &CandidateError) -> Option<Advisory> {
        self.record_failure(error.source_url.clone(), error.code, error.text.clone())
    }

    /// 是否已经达到过阈值（锁存）
    pub fn should_warn(&self) -> bool {
        self.warned
    }

    pub fn failures(&self) -> &[CandidateFailure] {
        &self.failures
    }
}

impl Default for DiagnosticsTracker {
    fn default() -> Self {
        Self::new(4)
    }
}
