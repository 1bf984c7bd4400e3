//! 连接协商状态机
//!
//! 状态: `Idle → RoleChosen → DescriptorExchanged → Connected`，失败时进入
//! `Failed`。有限次重试期间处于 `Connecting`，直到新的描述交换完成。
//! `checking` 只产生状态提示，不改变状态。数据通道打开后的失败不再重试。
//!
//! 发起方: `create_session` 生成 offer 令牌，`apply_answer` / `submit_answer`
//! 应用对方的 answer。在 offer 生成之前收到的 answer 存入单槽缓冲，
//! offer 生成后自动应用一次。
//!
//! 应答方: `apply_offer` 保存对方的 offer，`produce_answer` 创建传输并生成
//! answer 令牌。
//!
//! 传输层事件通过 `next_event` 逐个消费，连通性状态经 `classify` 映射为
//! 状态机动作。重试使用配置列表中的下一项，并且保持本端角色不变。
//! 通过 `attach_inbox` 接入的带外令牌在等待事件时一并处理。

pub mod guidance;
pub mod pending;

pub use guidance::troubleshooting_guide;
pub use pending::PendingSlot;

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{NegotiationSettings, TransportConfig};
use crate::diagnostics::{Advisory, DiagnosticsTracker};
use crate::signaling::{
    FileManifest, OfferPayload, SessionDescriptor, SignalingPayload, TokenError, decode,
    decode_answer, encode_answer, encode_offer, extract_token,
};
use crate::status::{Severity, StatusSink, format_size};
use crate::transport::{
    CandidateError, ConnectivityState, Role, Transport, TransportError, TransportEvent,
    TransportFactory, TransportHandle,
};

/// 协商状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    RoleChosen(Role),
    DescriptorExchanged,
    /// 重试中，旧传输已拆除，等待新的描述交换
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// 候选收集的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringOutcome {
    Complete,
    /// 超时后使用已收集到的候选继续
    TimedOut,
}

/// `submit_answer` 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDisposition {
    /// 还没有本地 offer，已缓存
    Buffered,
    Applied,
    /// 已经应用过，忽略
    AlreadyApplied,
}

/// 连通性状态对应的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    MarkConnected,
    Inform,
    Advise,
    Retry { attempt: u32 },
    GiveUp { attempts: u32 },
}

/// 将传输层连通性状态映射为动作；`failed_attempts` 为此前已失败的次数
pub fn classify(state: ConnectivityState, failed_attempts: u32, max_attempts: u32) -> Reaction {
    match state {
        ConnectivityState::Connected | ConnectivityState::Completed => Reaction::MarkConnected,
        ConnectivityState::Checking => Reaction::Inform,
        ConnectivityState::Disconnected => Reaction::Advise,
        ConnectivityState::Failed => {
            let attempts = failed_attempts + 1;
            if attempts < max_attempts {
                Reaction::Retry { attempt: attempts }
            } else {
                Reaction::GiveUp { attempts }
            }
        }
    }
}

/// 交给调用方的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    Connected,
    ChannelOpen,
    Message(Vec<u8>),
    /// 候选失败过多
    Advisory(Advisory),
    /// 连接中断，不会自动重试
    Disconnected,
    /// 已用备用配置重建传输，需要把新令牌重新交给对方
    Retrying { attempt: u32, token: String },
    /// 重试次数用尽
    Failed { attempts: u32 },
    /// 数据通道打开后连接失败；传输无法续传，会话结束
    Interrupted,
    ChannelClosed,
    /// 收件箱中的 answer 已应用
    AnswerApplied,
    /// 收件箱中的 offer 已处理，需要把 answer 交给对方
    AnswerReady { token: String },
    /// 收件箱中的令牌无效，会话状态不变
    TokenRejected(String),
}

/// `next_event` 等到的输入
enum Input {
    Transport(Option<TransportEvent>),
    Token(Option<String>),
}

/// 协商错误
#[derive(Debug, thiserror::Error)]
pub enum NegotiatorError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No active session: create an offer before applying an answer")]
    NoActiveSession,

    #[error("No remote descriptor: apply an offer before producing an answer")]
    NoRemoteDescriptor,

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(NegotiatorState),

    #[error("Connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("Connection lost after the data channel opened")]
    Interrupted,

    #[error("Invalid negotiation settings: {0}")]
    InvalidSettings(String),
}

/// 连接协商器，一个实例对应一个会话
pub struct Negotiator<F: TransportFactory> {
    factory: F,
    settings: NegotiationSettings,
    status: Arc<dyn StatusSink>,
    state: NegotiatorState,
    role: Option<Role>,
    link: Option<TransportHandle<F::Transport>>,
    manifest: Option<FileManifest>,
    remote_offer: Option<SessionDescriptor>,
    local_token: Option<String>,
    remote_applied: bool,
    /// 当前传输的数据通道已打开，之后的失败不再重试
    channel_open: bool,
    pending_answer: PendingSlot<String>,
    attempts: u32,
    diagnostics: DiagnosticsTracker,
    advisory: Option<Advisory>,
    /// 收集候选期间收到的其他传输事件
    deferred: VecDeque<TransportEvent>,
    /// 已就绪、尚未交给调用方的事件
    queued: VecDeque<NegotiatorEvent>,
    /// 带外令牌（链接或裸令牌）
    inbox: Option<mpsc::Receiver<String>>,
}

impl<F: TransportFactory> Negotiator<F> {
    pub fn new(factory: F, settings: NegotiationSettings, status: Arc<dyn StatusSink>) -> Self {
        let diagnostics = DiagnosticsTracker::new(settings.warn_threshold);
        Self {
            factory,
            settings,
            status,
            state: NegotiatorState::Idle,
            role: None,
            link: None,
            manifest: None,
            remote_offer: None,
            local_token: None,
            remote_applied: false,
            channel_open: false,
            pending_answer: PendingSlot::new(),
            attempts: 0,
            diagnostics,
            advisory: None,
            deferred: VecDeque::new(),
            queued: VecDeque::new(),
            inbox: None,
        }
    }

    /// 接入带外令牌来源，`next_event` 等待期间会处理其中的 offer/answer
    pub fn attach_inbox(&mut self, inbox: mpsc::Receiver<String>) {
        self.inbox = Some(inbox);
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// 已失败的连接次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn manifest(&self) -> Option<&FileManifest> {
        self.manifest.as_ref()
    }

    /// 最近一次交给调用方的本地令牌
    pub fn local_token(&self) -> Option<&str> {
        self.local_token.as_deref()
    }

    pub fn diagnostics(&self) -> &DiagnosticsTracker {
        &self.diagnostics
    }

    /// 未被成功连接清除的连通性提示
    pub fn advisory(&self) -> Option<&Advisory> {
        self.advisory.as_ref()
    }

    pub fn has_pending_answer(&self) -> bool {
        self.pending_answer.is_occupied()
    }

    pub fn settings(&self) -> &NegotiationSettings {
        &self.settings
    }

    /// 当前传输的数据通道
    pub fn channel(&self) -> Option<Arc<F::Transport>> {
        self.link.as_ref().map(|link| Arc::clone(&link.transport))
    }

    fn notify(&self, message: &str, severity: Severity) {
        self.status.on_status(message, severity);
    }

    fn check_settings(&self) -> Result<(), NegotiatorError> {
        self.settings
            .validate()
            .map_err(NegotiatorError::InvalidSettings)
    }

    /// 本次尝试使用的传输配置
    fn current_config(&self) -> Result<TransportConfig, NegotiatorError> {
        self.settings
            .config_for_attempt(self.attempts)
            .cloned()
            .ok_or_else(|| NegotiatorError::InvalidSettings("empty transport ladder".to_string()))
    }

    // ---- 发起方 ----

    /// 以发起方身份创建会话，返回 offer 令牌
    pub async fn create_session(&mut self, manifest: FileManifest) -> Result<String, NegotiatorError> {
        if self.state != NegotiatorState::Idle {
            return Err(NegotiatorError::InvalidState(self.state));
        }
        self.check_settings()?;

        info!(
            "Creating session for '{}' ({} bytes)",
            manifest.name, manifest.size
        );
        self.role = Some(Role::Offerer);
        self.manifest = Some(manifest);
        self.state = NegotiatorState::RoleChosen(Role::Offerer);

        let token = match self.start_offer().await {
            Ok(token) => token,
            Err(e) => {
                error!("Failed to create offer: {}", e);
                self.teardown().await;
                self.role = None;
                self.manifest = None;
                self.state = NegotiatorState::Idle;
                self.notify(&format!("创建分享链接失败: {}", e), Severity::Error);
                return Err(e);
            }
        };
        self.notify("分享链接已就绪，请发送给接收方", Severity::Success);

        if let Some(answer) = self.pending_answer.take() {
            debug!("Applying answer received before the offer existed");
            self.notify("正在自动处理先前收到的应答...", Severity::Info);
            if let Err(e) = self.apply_answer(&answer).await {
                warn!("Buffered answer could not be applied: {}", e);
                self.notify(&format!("处理先前收到的应答失败: {}", e), Severity::Error);
            }
        }

        Ok(token)
    }

    /// 提交 answer: 已有 offer 时立即应用，否则缓存
    pub async fn submit_answer(&mut self, token: &str) -> Result<AnswerDisposition, NegotiatorError> {
        // 先校验，格式错误不改变任何状态
        decode_answer(token)?;

        match self.role {
            Some(Role::Offerer) if self.local_token.is_some() => self.apply_answer(token).await,
            // 没有可用 offer 的发起方已经失败或关闭
            Some(_) => Err(NegotiatorError::InvalidState(self.state)),
            None if self.state == NegotiatorState::Closed => {
                Err(NegotiatorError::InvalidState(self.state))
            }
            None => {
                if self.pending_answer.put(token.to_string()).is_some() {
                    debug!("Replaced previously buffered answer");
                }
                info!("Answer buffered until an offer is created");
                self.notify("已收到应答，请先选择文件并创建分享链接", Severity::Info);
                Ok(AnswerDisposition::Buffered)
            }
        }
    }

    /// 应用 answer；必须已经生成 offer
    pub async fn apply_answer(&mut self, token: &str) -> Result<AnswerDisposition, NegotiatorError> {
        let answer = decode_answer(token)?;

        if self.role != Some(Role::Offerer) || self.local_token.is_none() {
            return Err(NegotiatorError::NoActiveSession);
        }
        if self.remote_applied || self.state == NegotiatorState::Connected {
            debug!("Answer already applied, ignoring");
            return Ok(AnswerDisposition::AlreadyApplied);
        }

        let transport = self.channel().ok_or(NegotiatorError::NoActiveSession)?;
        transport
            .apply_remote_descriptor(&answer.descriptor)
            .await?;
        self.remote_applied = true;
        self.state = NegotiatorState::DescriptorExchanged;

        info!("Remote answer applied");
        self.notify("应答已处理，正在建立连接...", Severity::Success);
        Ok(AnswerDisposition::Applied)
    }

    async fn start_offer(&mut self) -> Result<String, NegotiatorError> {
        let config = self.current_config()?;
        let handle = self.factory.create(Role::Offerer, &config).await?;
        let transport = Arc::clone(&handle.transport);
        self.link = Some(handle);
        self.remote_applied = false;

        let descriptor = transport.request_local_descriptor().await?;
        self.wait_for_gathering().await;
        let descriptor = transport.local_descriptor().await.unwrap_or(descriptor);

        let manifest = self
            .manifest
            .as_ref()
            .ok_or(NegotiatorError::InvalidState(self.state))?;
        let token = encode_offer(&descriptor, manifest)?;
        debug!(
            "Offer token ready ({} chars, '{}' configuration)",
            token.len(),
            config.label
        );
        self.local_token = Some(token.clone());
        Ok(token)
    }

    // ---- 应答方 ----

    /// 保存对方的 offer，此时还不创建传输
    pub fn apply_offer(&mut self, offer: OfferPayload) -> Result<(), NegotiatorError> {
        match self.state {
            NegotiatorState::Connected | NegotiatorState::Closed => {
                return Err(NegotiatorError::InvalidState(self.state));
            }
            _ if self.role == Some(Role::Offerer) => {
                return Err(NegotiatorError::InvalidState(self.state));
            }
            _ => {}
        }

        info!(
            "Offer received for '{}' ({} bytes)",
            offer.manifest.name, offer.manifest.size
        );
        self.notify(
            &format!(
                "收到文件: {} ({})",
                offer.manifest.name,
                format_size(offer.manifest.size)
            ),
            Severity::Info,
        );

        self.role = Some(Role::Answerer);
        self.remote_offer = Some(offer.descriptor);
        self.manifest = Some(offer.manifest);
        self.local_token = None;
        self.state = NegotiatorState::RoleChosen(Role::Answerer);
        Ok(())
    }

    /// 创建应答方传输，返回 answer 令牌
    pub async fn produce_answer(&mut self) -> Result<String, NegotiatorError> {
        if self.remote_offer.is_none() {
            return Err(NegotiatorError::NoRemoteDescriptor);
        }
        self.check_settings()?;
        if self.link.is_some() {
            // 新的 offer 替换了旧的，旧传输不再有用
            self.teardown().await;
        }

        match self.start_answer().await {
            Ok(token) => {
                self.notify("应答已生成，请发回给发送方", Severity::Info);
                Ok(token)
            }
            Err(e) => {
                error!("Failed to create answer: {}", e);
                self.teardown().await;
                self.notify(&format!("生成应答失败: {}", e), Severity::Error);
                Err(e)
            }
        }
    }

    async fn start_answer(&mut self) -> Result<String, NegotiatorError> {
        let remote = self
            .remote_offer
            .clone()
            .ok_or(NegotiatorError::NoRemoteDescriptor)?;
        let config = self.current_config()?;
        let handle = self.factory.create(Role::Answerer, &config).await?;
        let transport = Arc::clone(&handle.transport);
        self.link = Some(handle);

        transport.apply_remote_descriptor(&remote).await?;
        self.remote_applied = true;

        let descriptor = transport.request_local_descriptor().await?;
        self.wait_for_gathering().await;
        let descriptor = transport.local_descriptor().await.unwrap_or(descriptor);

        let token = encode_answer(&descriptor)?;
        debug!(
            "Answer token ready ({} chars, '{}' configuration)",
            token.len(),
            config.label
        );
        self.local_token = Some(token.clone());
        self.state = NegotiatorState::DescriptorExchanged;
        Ok(token)
    }

    // ---- 事件 ----

    /// 等待候选收集完成，最多等待 `gathering_timeout`
    async fn wait_for_gathering(&mut self) -> GatheringOutcome {
        let timeout = self.settings.gathering_timeout;
        let Self {
            link,
            deferred,
            queued,
            diagnostics,
            advisory,
            status,
            ..
        } = self;
        let Some(link) = link.as_mut() else {
            return GatheringOutcome::Complete;
        };

        let gathering = async {
            while let Some(event) = link.events.recv().await {
                match event {
                    TransportEvent::GatheringComplete => return true,
                    TransportEvent::CandidateError(candidate) => {
                        if let Some(a) = observe_candidate_error(diagnostics, &**status, &candidate) {
                            *advisory = Some(a.clone());
                            queued.push_back(NegotiatorEvent::Advisory(a));
                        }
                    }
                    other => deferred.push_back(other),
                }
            }
            false
        };

        match tokio::time::timeout(timeout, gathering).await {
            Ok(true) => GatheringOutcome::Complete,
            Ok(false) => {
                warn!("Transport event stream ended during candidate gathering");
                GatheringOutcome::Complete
            }
            Err(_) => {
                warn!(
                    "Candidate gathering did not complete within {:?}, continuing with partial candidates",
                    timeout
                );
                status.on_status("候选收集超时，使用已收集到的候选继续", Severity::Warn);
                GatheringOutcome::TimedOut
            }
        }
    }

    /// 取下一个事件；会话结束或没有传输时返回 `None`
    pub async fn next_event(&mut self) -> Option<NegotiatorEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            if matches!(self.state, NegotiatorState::Failed | NegotiatorState::Closed) {
                return None;
            }

            let input = match self.deferred.pop_front() {
                Some(event) => Input::Transport(Some(event)),
                None => self.wait_input().await?,
            };

            let event = match input {
                Input::Transport(Some(event)) => self.handle_transport_event(event).await,
                Input::Transport(None) => {
                    debug!("Transport event stream closed");
                    return None;
                }
                Input::Token(Some(token)) => self.accept_remote_token(&token).await,
                Input::Token(None) => {
                    debug!("Token inbox closed");
                    self.inbox = None;
                    None
                }
            };
            if event.is_some() {
                return event;
            }
        }
    }

    /// 同时等待传输事件和带外令牌；两者都没有时返回 `None`
    async fn wait_input(&mut self) -> Option<Input> {
        match (self.link.as_mut(), self.inbox.as_mut()) {
            (Some(link), Some(inbox)) => Some(tokio::select! {
                event = link.events.recv() => Input::Transport(event),
                token = inbox.recv() => Input::Token(token),
            }),
            (Some(link), None) => Some(Input::Transport(link.events.recv().await)),
            (None, Some(inbox)) => Some(Input::Token(inbox.recv().await)),
            (None, None) => None,
        }
    }

    async fn accept_remote_token(&mut self, input: &str) -> Option<NegotiatorEvent> {
        match self.consume_remote_token(input).await {
            Ok(event) => event,
            Err(e) => {
                warn!("Rejected out-of-band token: {}", e);
                self.notify(&format!("令牌无效: {}", e), Severity::Error);
                Some(NegotiatorEvent::TokenRejected(e.to_string()))
            }
        }
    }

    /// 按令牌类型分派: offer 走应答方流程，answer 走发起方流程
    async fn consume_remote_token(
        &mut self,
        input: &str,
    ) -> Result<Option<NegotiatorEvent>, NegotiatorError> {
        let token = extract_token(input)?;
        match decode(&token)? {
            SignalingPayload::Offer(offer) => {
                self.apply_offer(offer)?;
                let answer = self.produce_answer().await?;
                Ok(Some(NegotiatorEvent::AnswerReady { token: answer }))
            }
            SignalingPayload::Answer(_) => {
                let disposition = self.submit_answer(&token).await?;
                Ok((disposition == AnswerDisposition::Applied).then_some(NegotiatorEvent::AnswerApplied))
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<NegotiatorEvent> {
        match event {
            TransportEvent::GatheringComplete => None,
            TransportEvent::CandidateError(candidate) => {
                let advisory =
                    observe_candidate_error(&mut self.diagnostics, self.status.as_ref(), &candidate)?;
                self.advisory = Some(advisory.clone());
                Some(NegotiatorEvent::Advisory(advisory))
            }
            TransportEvent::Connectivity(state) => self.on_connectivity(state).await,
            TransportEvent::ChannelOpen => {
                info!("Data channel open");
                self.channel_open = true;
                Some(NegotiatorEvent::ChannelOpen)
            }
            TransportEvent::Message(data) => Some(NegotiatorEvent::Message(data)),
            TransportEvent::ChannelClosed => {
                info!("Data channel closed by peer");
                self.notify("连接已关闭", Severity::Info);
                Some(NegotiatorEvent::ChannelClosed)
            }
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) -> Option<NegotiatorEvent> {
        debug!("Connectivity state: {:?}", state);

        match classify(state, self.attempts, self.settings.max_attempts) {
            Reaction::Inform => {
                self.notify("正在寻找连接路径...", Severity::Info);
                None
            }
            Reaction::MarkConnected => {
                if self.state == NegotiatorState::Connected {
                    return None;
                }
                self.state = NegotiatorState::Connected;
                self.advisory = None;
                let failures = self.diagnostics.failures().len();
                if failures > 0 {
                    info!("Connected despite {} candidate failures", failures);
                } else {
                    info!("Peers connected");
                }
                self.notify("节点连接成功", Severity::Success);
                Some(NegotiatorEvent::Connected)
            }
            Reaction::Advise => {
                warn!("Connection lost");
                self.notify("连接已断开，请尝试重新创建分享链接", Severity::Warn);
                Some(NegotiatorEvent::Disconnected)
            }
            Reaction::Retry { .. } | Reaction::GiveUp { .. } if self.channel_open => {
                Some(self.interrupt().await)
            }
            Reaction::Retry { attempt } => {
                self.attempts = attempt;
                self.state = NegotiatorState::Failed;
                warn!(
                    "Connection attempt {} failed, retrying in {:?}",
                    attempt, self.settings.retry_backoff
                );
                match self.retry().await {
                    Ok(token) => Some(NegotiatorEvent::Retrying { attempt, token }),
                    Err(e) => {
                        error!("Retry failed: {}", e);
                        Some(self.give_up().await)
                    }
                }
            }
            Reaction::GiveUp { attempts } => {
                self.attempts = attempts;
                Some(self.give_up().await)
            }
        }
    }

    /// 拆除旧传输后，用下一项配置以同一角色重建
    async fn retry(&mut self) -> Result<String, NegotiatorError> {
        tokio::time::sleep(self.settings.retry_backoff).await;
        self.teardown().await;
        self.state = NegotiatorState::Connecting;

        let config = self.current_config()?;
        info!(
            "Retrying as {:?} with '{}' configuration",
            self.role, config.label
        );
        self.notify("正在使用备用服务器重试...", Severity::Info);

        match self.role {
            Some(Role::Offerer) => self.start_offer().await,
            Some(Role::Answerer) => self.start_answer().await,
            None => Err(NegotiatorError::InvalidState(self.state)),
        }
    }

    async fn give_up(&mut self) -> NegotiatorEvent {
        let attempts = self.attempts;
        error!("Connection failed after {} attempts", attempts);
        self.teardown().await;
        self.state = NegotiatorState::Failed;

        let last_config = self.settings.config_for_attempt(attempts.saturating_sub(1));
        debug!(
            "Relay servers in last configuration: {:?}",
            last_config.map(TransportConfig::relay_servers)
        );
        let guide = troubleshooting_guide(last_config);
        self.notify(&guide, Severity::Error);
        NegotiatorEvent::Failed { attempts }
    }

    /// 数据通道打开后的失败: 已传输的数据无法续传，直接结束会话
    async fn interrupt(&mut self) -> NegotiatorEvent {
        error!("Connection failed after the data channel opened, ending session");
        self.teardown().await;
        self.state = NegotiatorState::Failed;
        self.notify("传输过程中连接中断，请重新创建分享链接", Severity::Error);
        NegotiatorEvent::Interrupted
    }

    /// 关闭当前传输并丢弃其事件流
    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.transport.close().await;
        }
        self.deferred.clear();
        self.remote_applied = false;
        self.channel_open = false;
        self.local_token = None;
    }

    /// 结束会话
    pub async fn close(&mut self) {
        self.teardown().await;
        self.pending_answer.clear();
        self.state = NegotiatorState::Closed;
        debug!("Negotiator closed");
    }
}

fn observe_candidate_error(
    diagnostics: &mut DiagnosticsTracker,
    status: &dyn StatusSink,
    candidate: &CandidateError,
) -> Option<Advisory> {
    let advisory = diagnostics.record(candidate)?;
    status.on_status(&advisory.message, Severity::Warn);
    Some(advisory)
}
