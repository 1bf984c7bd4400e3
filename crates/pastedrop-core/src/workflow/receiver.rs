//! 接收端工作流
//!
//! 高层 API 封装完整的接收流程:
//! 1. 解析发送方的 offer（链接或裸令牌），生成 answer 和回传链接
//! 2. 等待数据通道打开，按到达顺序拼接分块
//! 3. 收齐后保存一次

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{NegotiationSettings, Settings};
use crate::negotiator::{Negotiator, NegotiatorError, NegotiatorEvent};
use crate::signaling::{FileManifest, decode_offer, extract_token};
use crate::status::{ProgressSink, Severity, StatusEntry, StatusSink};
use crate::transfer::{Persistence, Reassembler, ReceivedFile, TransferError};
use crate::transport::TransportFactory;
use crate::workflow::{ShareToken, token_inbox};

/// 接收进度回调
pub trait ReceiveProgressCallback: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str, severity: Severity);
    /// 收到发送方的文件信息
    fn on_offer(&self, manifest: &FileManifest);
    /// 有新的 answer 需要交回发送方
    fn on_token(&self, share: &ShareToken);
    /// 进度更新，取值 0..=1
    fn on_progress(&self, fraction: f64);
    /// 接收完成
    fn on_complete(&self, path: &Path);
    /// 接收失败
    fn on_error(&self, error: &str);
}

/// 接收选项
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// 回传链接的基础地址
    pub share_base_url: String,
    pub negotiation: NegotiationSettings,
}

impl From<&Settings> for ReceiveOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            share_base_url: settings.share_base_url.clone(),
            negotiation: settings.negotiation(),
        }
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

struct CallbackSink<C>(Arc<C>);

impl<C: ReceiveProgressCallback> StatusSink for CallbackSink<C> {
    fn on_status(&self, message: &str, severity: Severity) {
        self.0.on_status(message, severity);
    }
}

impl<C: ReceiveProgressCallback> ProgressSink for CallbackSink<C> {
    fn on_progress(&self, fraction: f64) {
        self.0.on_progress(fraction);
    }
}

/// 接收端会话
pub struct ReceiveSession<F: TransportFactory, C: ReceiveProgressCallback + 'static> {
    negotiator: Negotiator<F>,
    callback: Arc<C>,
    options: ReceiveOptions,
    persistence: Arc<dyn Persistence>,
    reassembler: Option<Reassembler>,
}

impl<F: TransportFactory, C: ReceiveProgressCallback + 'static> ReceiveSession<F, C> {
    pub fn new(
        factory: F,
        options: ReceiveOptions,
        persistence: Arc<dyn Persistence>,
        callback: Arc<C>,
    ) -> Self {
        let status: Arc<dyn StatusSink> = Arc::new(CallbackSink(Arc::clone(&callback)));
        let negotiator = Negotiator::new(factory, options.negotiation.clone(), status);
        Self {
            negotiator,
            callback,
            options,
            persistence,
            reassembler: None,
        }
    }

    pub fn negotiator(&self) -> &Negotiator<F> {
        &self.negotiator
    }

    /// 返回一个发送端，`run` 期间写入的 offer 会被自动处理并生成新的 answer
    pub fn token_inbox(&mut self) -> mpsc::Sender<String> {
        let (tx, rx) = token_inbox();
        self.negotiator.attach_inbox(rx);
        tx
    }

    /// 处理 offer（链接或裸令牌），返回需要交回发送方的 answer
    pub async fn accept_offer(&mut self, input: &str) -> anyhow::Result<ShareToken> {
        let offer = decode_offer(&extract_token(input)?)?;
        self.negotiator.apply_offer(offer)?;
        self.begin_reassembly();

        let token = match self.negotiator.produce_answer().await {
            Ok(token) => token,
            Err(e) => {
                self.callback.on_error(&e.to_string());
                return Err(e.into());
            }
        };
        Ok(self.share_answer(token))
    }

    fn begin_reassembly(&mut self) {
        self.reassembler = self.negotiator.manifest().cloned().map(Reassembler::new);
        if let Some(reassembler) = &self.reassembler {
            self.callback.on_offer(reassembler.manifest());
        }
    }

    fn share_answer(&self, token: String) -> ShareToken {
        let share = ShareToken::answer(&self.options.share_base_url, token);
        self.callback.on_token(&share);
        share
    }

    /// 等待连接建立，接收并保存文件
    pub async fn run(&mut self) -> anyhow::Result<PathBuf> {
        let result = self.drive().await;
        match &result {
            Ok(path) => self.callback.on_complete(path),
            Err(e) => self.callback.on_error(&format!("{:#}", e)),
        }
        result
    }

    async fn drive(&mut self) -> anyhow::Result<PathBuf> {
        while let Some(event) = self.negotiator.next_event().await {
            match event {
                NegotiatorEvent::AnswerReady { token } => {
                    self.begin_reassembly();
                    self.share_answer(token);
                }
                NegotiatorEvent::Retrying { attempt, token } => {
                    // 已收到的数据不能丢弃重来
                    let received = self.received_bytes();
                    if received > 0 {
                        anyhow::bail!(
                            "Connection restarted after {} bytes were received, file incomplete",
                            received
                        );
                    }
                    info!("Reissuing answer after failed attempt {}", attempt);
                    self.begin_reassembly();
                    self.share_answer(token);
                }
                NegotiatorEvent::ChannelOpen => {
                    // 空文件不会有任何消息
                    if let Some(file) = self.reassembler_mut()?.take_if_complete() {
                        return self.finalize(file).await;
                    }
                    self.callback.on_status("开始接收文件...", Severity::Info);
                }
                NegotiatorEvent::Message(data) => {
                    let progress = CallbackSink(Arc::clone(&self.callback));
                    if let Some(file) = self.reassembler_mut()?.push(data, &progress) {
                        return self.finalize(file).await;
                    }
                }
                NegotiatorEvent::Failed { attempts } => {
                    return Err(NegotiatorError::ConnectionFailed { attempts }.into());
                }
                NegotiatorEvent::Interrupted => {
                    return Err(NegotiatorError::Interrupted.into());
                }
                NegotiatorEvent::ChannelClosed => {
                    let received = self.received_bytes();
                    anyhow::bail!(
                        "Sender closed the channel after {} bytes, file incomplete",
                        received
                    );
                }
                NegotiatorEvent::Connected
                | NegotiatorEvent::Advisory(_)
                | NegotiatorEvent::Disconnected
                | NegotiatorEvent::AnswerApplied
                | NegotiatorEvent::TokenRejected(_) => {}
            }
        }
        anyhow::bail!("Session ended before the file was received")
    }

    fn received_bytes(&self) -> u64 {
        self.reassembler
            .as_ref()
            .map(|r| r.state().received_count())
            .unwrap_or_default()
    }

    fn reassembler_mut(&mut self) -> anyhow::Result<&mut Reassembler> {
        self.reassembler
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Data arrived before an offer was accepted"))
    }

    async fn finalize(&mut self, file: ReceivedFile) -> anyhow::Result<PathBuf> {
        debug!("Persisting '{}' ({} bytes)", file.name, file.bytes.len());
        let path = self
            .persistence
            .save(&file.bytes, &file.name, &file.mime_type)
            .await
            .map_err(TransferError::FinalizeError)?;

        self.callback
            .on_status(&format!("文件已保存: {}", path.display()), Severity::Success);
        Ok(path)
    }

    /// 结束会话并释放传输
    pub async fn close(&mut self) {
        self.negotiator.close().await;
    }
}

/// 简化的接收回调实现
pub struct SimpleReceiveCallback {
    tx: mpsc::Sender<ReceiveEvent>,
}

#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    Status(StatusEntry),
    Offer(FileManifest),
    Token(ShareToken),
    Progress(f64),
    Complete(PathBuf),
    Error(String),
}

impl SimpleReceiveCallback {
    pub fn new() -> (Self, mpsc::Receiver<ReceiveEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl ReceiveProgressCallback for SimpleReceiveCallback {
    fn on_status(&self, status: &str, severity: Severity) {
        let _ = self
            .tx
            .try_send(ReceiveEvent::Status(StatusEntry::new(severity, status)));
    }

    fn on_offer(&self, manifest: &FileManifest) {
        let _ = self.tx.try_send(ReceiveEvent::Offer(manifest.clone()));
    }

    fn on_token(&self, share: &ShareToken) {
        let _ = self.tx.try_send(ReceiveEvent::Token(share.clone()));
    }

    fn on_progress(&self, fraction: f64) {
        let _ = self.tx.try_send(ReceiveEvent::Progress(fraction));
    }

    fn on_complete(&self, path: &Path) {
        let _ = self.tx.try_send(ReceiveEvent::Complete(path.to_path_buf()));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(ReceiveEvent::Error(error.to_string()));
    }
}
