//! 发送端工作流
//!
//! 高层 API 封装完整的发送流程:
//! 1. 读取文件信息，生成 offer 令牌和分享链接
//! 2. 接收对方的 answer（链接或裸令牌，可以早于 offer 到达）
//! 3. 等待数据通道打开，分块发送文件
//!
//! 连接失败重试时会生成新的 offer，通过 `on_token` 交给调用方。

use anyhow::{Context, anyhow};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{NegotiationSettings, Settings, TransferSettings};
use crate::negotiator::{AnswerDisposition, Negotiator, NegotiatorError, NegotiatorEvent};
use crate::signaling::{FileManifest, extract_token};
use crate::status::{ProgressSink, Severity, StatusEntry, StatusSink, format_size};
use crate::transfer::{ChunkPlan, SendSummary, stream_chunks};
use crate::transport::TransportFactory;
use crate::workflow::{ShareToken, token_inbox};

/// 发送进度回调
pub trait SendProgressCallback: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str, severity: Severity);
    /// 有新的 offer 需要交给接收方（首次创建或重试后）
    fn on_token(&self, share: &ShareToken);
    /// 进度更新，取值 0..=1
    fn on_progress(&self, fraction: f64);
    /// 发送完成
    fn on_complete(&self, summary: &SendSummary);
    /// 发送失败
    fn on_error(&self, error: &str);
}

/// 发送选项
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// 分享链接的基础地址
    pub share_base_url: String,
    pub negotiation: NegotiationSettings,
    pub transfer: TransferSettings,
}

impl From<&Settings> for SendOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            share_base_url: settings.share_base_url.clone(),
            negotiation: settings.negotiation(),
            transfer: settings.transfer(),
        }
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// 已读取信息、等待发送的文件
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub path: PathBuf,
    pub manifest: FileManifest,
}

/// 读取文件大小并推断 MIME 类型
pub async fn prepare_file(path: &Path) -> anyhow::Result<PreparedFile> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    Ok(PreparedFile {
        path: path.to_path_buf(),
        manifest: FileManifest::new(name, metadata.len(), mime_type),
    })
}

/// 把回调接到协商器和分块发送上
struct CallbackSink<C>(Arc<C>);

impl<C: SendProgressCallback> StatusSink for CallbackSink<C> {
    fn on_status(&self, message: &str, severity: Severity) {
        self.0.on_status(message, severity);
    }
}

impl<C: SendProgressCallback> ProgressSink for CallbackSink<C> {
    fn on_progress(&self, fraction: f64) {
        self.0.on_progress(fraction);
    }
}

/// 发送端会话，一个实例发送一个文件
pub struct SendSession<F: TransportFactory, C: SendProgressCallback + 'static> {
    negotiator: Negotiator<F>,
    callback: Arc<C>,
    options: SendOptions,
    file: Option<PreparedFile>,
}

impl<F: TransportFactory, C: SendProgressCallback + 'static> SendSession<F, C> {
    pub fn new(factory: F, options: SendOptions, callback: Arc<C>) -> Self {
        let status: Arc<dyn StatusSink> = Arc::new(CallbackSink(Arc::clone(&callback)));
        let negotiator = Negotiator::new(factory, options.negotiation.clone(), status);
        Self {
            negotiator,
            callback,
            options,
            file: None,
        }
    }

    pub fn negotiator(&self) -> &Negotiator<F> {
        &self.negotiator
    }

    pub fn file(&self) -> Option<&PreparedFile> {
        self.file.as_ref()
    }

    /// 返回一个发送端，`run` 期间写入的 answer 会被自动应用
    pub fn token_inbox(&mut self) -> mpsc::Sender<String> {
        let (tx, rx) = token_inbox();
        self.negotiator.attach_inbox(rx);
        tx
    }

    /// 准备文件并生成 offer
    pub async fn offer(&mut self, path: &Path) -> anyhow::Result<ShareToken> {
        let file = match prepare_file(path).await {
            Ok(file) => file,
            Err(e) => {
                self.callback.on_error(&e.to_string());
                return Err(e);
            }
        };
        self.callback.on_status(
            &format!(
                "准备发送: {} ({})",
                file.manifest.name,
                format_size(file.manifest.size)
            ),
            Severity::Info,
        );

        let token = match self.negotiator.create_session(file.manifest.clone()).await {
            Ok(token) => token,
            Err(e) => {
                self.callback.on_error(&e.to_string());
                return Err(e.into());
            }
        };
        self.file = Some(file);

        let share = ShareToken::offer(&self.options.share_base_url, token);
        self.callback.on_token(&share);
        Ok(share)
    }

    /// 提交接收方的 answer（链接或裸令牌）
    pub async fn accept_answer(&mut self, input: &str) -> anyhow::Result<AnswerDisposition> {
        let token = extract_token(input)?;
        Ok(self.negotiator.submit_answer(&token).await?)
    }

    /// 等待连接建立并发送文件
    pub async fn run(&mut self) -> anyhow::Result<SendSummary> {
        let result = self.drive().await;
        match &result {
            Ok(summary) => self.callback.on_complete(summary),
            Err(e) => self.callback.on_error(&format!("{:#}", e)),
        }
        result
    }

    async fn drive(&mut self) -> anyhow::Result<SendSummary> {
        while let Some(event) = self.negotiator.next_event().await {
            match event {
                NegotiatorEvent::ChannelOpen => return self.stream_file().await,
                NegotiatorEvent::Retrying { attempt, token } => {
                    info!("Reissuing offer after failed attempt {}", attempt);
                    let share = ShareToken::offer(&self.options.share_base_url, token);
                    self.callback.on_token(&share);
                }
                NegotiatorEvent::Failed { attempts } => {
                    return Err(NegotiatorError::ConnectionFailed { attempts }.into());
                }
                NegotiatorEvent::Interrupted => {
                    return Err(NegotiatorError::Interrupted.into());
                }
                NegotiatorEvent::ChannelClosed => {
                    anyhow::bail!("Data channel closed before the transfer started");
                }
                NegotiatorEvent::Message(data) => {
                    debug!("Ignoring {} bytes from the receiver", data.len());
                }
                // 状态已经由协商器报告
                NegotiatorEvent::Connected
                | NegotiatorEvent::Advisory(_)
                | NegotiatorEvent::Disconnected
                | NegotiatorEvent::AnswerApplied
                | NegotiatorEvent::AnswerReady { .. }
                | NegotiatorEvent::TokenRejected(_) => {}
            }
        }
        anyhow::bail!("Session ended before the data channel opened")
    }

    async fn stream_file(&mut self) -> anyhow::Result<SendSummary> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| anyhow!("No file prepared for sending"))?;
        let channel = self
            .negotiator
            .channel()
            .ok_or(NegotiatorError::NoActiveSession)?;

        self.callback
            .on_status(&format!("开始发送: {}", file.manifest.name), Severity::Info);

        let mut reader = tokio::fs::File::open(&file.path)
            .await
            .with_context(|| format!("Cannot open {}", file.path.display()))?;
        let plan = ChunkPlan::new(file.manifest.size, self.options.transfer.chunk_size);
        let progress = CallbackSink(Arc::clone(&self.callback));
        let summary = stream_chunks(&mut reader, plan, channel.as_ref(), &progress).await?;

        self.callback.on_status("文件发送成功", Severity::Success);
        Ok(summary)
    }

    /// 结束会话并释放传输
    pub async fn close(&mut self) {
        self.negotiator.close().await;
    }
}

/// 简化的发送回调实现
pub struct SimpleSendCallback {
    tx: mpsc::Sender<SendEvent>,
}

#[derive(Debug, Clone)]
pub enum SendEvent {
    Status(StatusEntry),
    Token(ShareToken),
    Progress(f64),
    Complete(SendSummary),
    Error(String),
}

impl SimpleSendCallback {
    pub fn new() -> (Self, mpsc::Receiver<SendEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl SendProgressCallback for SimpleSendCallback {
    fn on_status(&self, status: &str, severity: Severity) {
        let _ = self
            .tx
            .try_send(SendEvent::Status(StatusEntry::new(severity, status)));
    }

    fn on_token(&self, share: &ShareToken) {
        let _ = self.tx.try_send(SendEvent::Token(share.clone()));
    }

    fn on_progress(&self, fraction: f64) {
        let _ = self.tx.try_send(SendEvent::Progress(fraction));
    }

    fn on_complete(&self, summary: &SendSummary) {
        let _ = self.tx.try_send(SendEvent::Complete(*summary));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(SendEvent::Error(error.to_string()));
    }
}
