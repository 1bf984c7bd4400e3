//! 进程内回环传输
//!
//! 同一个 `MemoryNetwork` 上创建的传输实例可以互相连接。连接描述中
//! 只记录实例 ID 和收集到的“候选”，不涉及真实网络。
//!
//! 通过 `FaultPlan` 可以注入故障:
//! - 屏蔽指定服务器 URL，收集时为其上报候选错误
//! - 让前 N 次连接失败
//! - 收集永不完成（用于超时路径）
//! - 发送 N 条消息后发送失败
//! - 发送 N 条消息后整条连接失败（双方收到 `failed`）

use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::signaling::{DescriptorKind, SessionDescriptor};
use crate::transport::{
    CandidateError, ConnectivityState, DataChannel, Role, Transport, TransportError,
    TransportEvent, TransportFactory, TransportHandle,
};

const EVENT_CAPACITY: usize = 64;

/// 描述中标识实例的行
const ORIGIN_PREFIX: &str = "o=pastedrop-memory ";

/// 服务器不可达时上报的错误码
const UNREACHABLE_CODE: u16 = 701;

/// 故障注入计划
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub blocked_servers: HashSet<String>,
    pub connection_failures: u32,
    pub stall_gathering: bool,
    pub send_limit: Option<usize>,
    pub link_failure_after: Option<usize>,
}

impl FaultPlan {
    pub fn block_server(mut self, url: impl Into<String>) -> Self {
        self.blocked_servers.insert(url.into());
        self
    }

    /// 屏蔽配置中的全部服务器
    pub fn block_all_servers(mut self, config: &TransportConfig) -> Self {
        self.blocked_servers
            .extend(config.server_urls().map(str::to_string));
        self
    }

    pub fn fail_connections(mut self, count: u32) -> Self {
        self.connection_failures = count;
        self
    }

    pub fn stall_gathering(mut self) -> Self {
        self.stall_gathering = true;
        self
    }

    pub fn fail_sends_after(mut self, count: usize) -> Self {
        self.send_limit = Some(count);
        self
    }

    /// 成功发送 `count` 条消息后连接失败，双方都会收到 `failed`
    pub fn fail_link_after(mut self, count: usize) -> Self {
        self.link_failure_after = Some(count);
        self
    }
}

struct Endpoint {
    role: Role,
    events: mpsc::Sender<TransportEvent>,
    peer: Option<Uuid>,
    open: bool,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<Uuid, Endpoint>,
    faults: FaultPlan,
    sends: usize,
    created: Vec<(Role, String)>,
}

impl NetworkState {
    /// 投递控制事件；队列被消息占满时改由后台任务投递，不丢事件
    fn notify(&self, id: Uuid, event: TransportEvent) {
        let Some(endpoint) = self.endpoints.get(&id) else {
            return;
        };
        match endpoint.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue of {} is full, delivering {:?} later", id, event);
                let events = endpoint.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event stream of {} already dropped", id);
            }
        }
    }

    /// 连接中断: 双方通道关闭并收到 `failed`
    fn break_link(&mut self, id: Uuid, peer: Uuid) {
        for endpoint in [id, peer] {
            if let Some(e) = self.endpoints.get_mut(&endpoint) {
                e.open = false;
            }
            self.notify(endpoint, TransportEvent::Connectivity(ConnectivityState::Failed));
        }
    }

    fn connect(&mut self, offerer: Uuid, answerer: Uuid) {
        let fail = self.faults.connection_failures > 0;
        if fail {
            self.faults.connection_failures -= 1;
            debug!("Injected connection failure between {} and {}", offerer, answerer);
        }

        for id in [offerer, answerer] {
            self.notify(id, TransportEvent::Connectivity(ConnectivityState::Checking));
            if fail {
                self.notify(id, TransportEvent::Connectivity(ConnectivityState::Failed));
                continue;
            }
            if let Some(endpoint) = self.endpoints.get_mut(&id) {
                endpoint.open = true;
            }
            self.notify(id, TransportEvent::Connectivity(ConnectivityState::Connected));
            self.notify(id, TransportEvent::ChannelOpen);
        }
    }
}

/// 进程内网络，同时也是传输工厂
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                faults,
                ..Default::default()
            })),
        }
    }

    /// 当前未关闭的实例数
    pub async fn live_transports(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    /// 按创建顺序记录的 (角色, 配置名)
    pub async fn created(&self) -> Vec<(Role, String)> {
        self.state.lock().await.created.clone()
    }
}

#[async_trait::async_trait]
impl TransportFactory for MemoryNetwork {
    type Transport = MemoryTransport;

    async fn create(
        &self,
        role: Role,
        config: &TransportConfig,
    ) -> Result<TransportHandle<MemoryTransport>, TransportError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let id = Uuid::new_v4();

        let mut state = self.state.lock().await;
        state.endpoints.insert(
            id,
            Endpoint {
                role,
                events: events_tx,
                peer: None,
                open: false,
            },
        );
        state.created.push((role, config.label.clone()));
        drop(state);

        debug!(
            "Memory transport {} created as {} with '{}' configuration",
            id, role, config.label
        );

        Ok(TransportHandle {
            transport: Arc::new(MemoryTransport {
                id,
                role,
                config: config.clone(),
                network: self.clone(),
                local: Mutex::new(None),
            }),
            events: events_rx,
        })
    }
}

/// 回环传输实例
pub struct MemoryTransport {
    id: Uuid,
    role: Role,
    config: TransportConfig,
    network: MemoryNetwork,
    local: Mutex<Option<SessionDescriptor>>,
}

impl MemoryTransport {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

fn parse_origin(sdp: &str) -> Option<Uuid> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(ORIGIN_PREFIX))
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

#[async_trait::async_trait]
impl DataChannel for MemoryTransport {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let peer_events = {
            let mut state = self.network.state.lock().await;
            let endpoint = state.endpoints.get(&self.id).ok_or(TransportError::Closed)?;
            if !endpoint.open {
                return Err(TransportError::ChannelNotOpen);
            }
            let peer = endpoint.peer.ok_or(TransportError::ChannelNotOpen)?;
            let peer_events = state
                .endpoints
                .get(&peer)
                .map(|p| p.events.clone())
                .ok_or(TransportError::Closed)?;

            if state.faults.link_failure_after.is_some_and(|limit| state.sends >= limit) {
                state.faults.link_failure_after = None;
                debug!("Injected link failure between {} and {}", self.id, peer);
                state.break_link(self.id, peer);
                return Err(TransportError::SendFailed("connection lost".to_string()));
            }
            if let Some(limit) = state.faults.send_limit {
                if state.sends >= limit {
                    return Err(TransportError::SendFailed(format!(
                        "injected failure after {} messages",
                        limit
                    )));
                }
            }
            state.sends += 1;
            peer_events
        };

        // 等待对端消费，形成背压
        peer_events
            .send(TransportEvent::Message(data))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn request_local_descriptor(&self) -> Result<SessionDescriptor, TransportError> {
        let state = self.network.state.lock().await;
        let endpoint = state.endpoints.get(&self.id).ok_or(TransportError::Closed)?;

        let kind = match self.role {
            Role::Offerer => DescriptorKind::Offer,
            Role::Answerer if endpoint.peer.is_none() => {
                return Err(TransportError::Other(
                    "remote offer must be applied before answering".to_string(),
                ));
            }
            Role::Answerer => DescriptorKind::Answer,
        };

        let mut sdp = format!(
            "v=0\r\n{}{}\r\na=config:{}\r\na=candidate:0 1 udp 2122260223 127.0.0.1 9 typ host\r\n",
            ORIGIN_PREFIX, self.id, self.config.label
        );
        for (index, url) in self.config.server_urls().enumerate() {
            if state.faults.blocked_servers.contains(url) {
                let _ = endpoint
                    .events
                    .try_send(TransportEvent::CandidateError(CandidateError {
                        source_url: url.to_string(),
                        code: UNREACHABLE_CODE,
                        text: "Server unreachable".to_string(),
                    }));
            } else {
                sdp.push_str(&format!(
                    "a=candidate:{} 1 udp 1 {} typ srflx\r\n",
                    index + 1,
                    url
                ));
            }
        }

        if !state.faults.stall_gathering {
            let _ = endpoint.events.try_send(TransportEvent::GatheringComplete);
        }
        drop(state);

        let descriptor = SessionDescriptor { kind, sdp };
        *self.local.lock().await = Some(descriptor.clone());
        Ok(descriptor)
    }

    async fn local_descriptor(&self) -> Option<SessionDescriptor> {
        self.local.lock().await.clone()
    }

    async fn apply_remote_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), TransportError> {
        let peer = parse_origin(&descriptor.sdp).ok_or_else(|| {
            TransportError::InvalidDescriptor("missing origin line".to_string())
        })?;

        let mut state = self.network.state.lock().await;
        if !state.endpoints.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }

        match (self.role, descriptor.kind) {
            (Role::Answerer, DescriptorKind::Offer) => {
                // 对端可能已经关闭，连接时再检查
                if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
                    endpoint.peer = Some(peer);
                }
                Ok(())
            }
            (Role::Offerer, DescriptorKind::Answer) => {
                let answered_us = state
                    .endpoints
                    .get(&peer)
                    .is_some_and(|p| p.role == Role::Answerer && p.peer == Some(self.id));
                if !answered_us {
                    return Err(TransportError::InvalidDescriptor(
                        "answer does not belong to this offer".to_string(),
                    ));
                }
                if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
                    endpoint.peer = Some(peer);
                }
                state.connect(self.id, peer);
                Ok(())
            }
            (role, kind) => Err(TransportError::InvalidDescriptor(format!(
                "{} cannot apply a remote {}",
                role, kind
            ))),
        }
    }

    async fn close(&self) {
        let mut state = self.network.state.lock().await;
        if let Some(endpoint) = state.endpoints.remove(&self.id) {
            if let (true, Some(peer)) = (endpoint.open, endpoint.peer) {
                state.notify(peer, TransportEvent::ChannelClosed);
            }
            debug!("Memory transport {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(events: &mut mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn connected_pair(
        network: &MemoryNetwork,
    ) -> (
        TransportHandle<MemoryTransport>,
        TransportHandle<MemoryTransport>,
    ) {
        let config = TransportConfig::primary();
        let offerer = network.create(Role::Offerer, &config).await.unwrap();
        let answerer = network.create(Role::Answerer, &config).await.unwrap();

        let offer = offerer.transport.request_local_descriptor().await.unwrap();
        answerer
            .transport
            .apply_remote_descriptor(&offer)
            .await
            .unwrap();
        let answer = answerer.transport.request_local_descriptor().await.unwrap();
        offerer
            .transport
            .apply_remote_descriptor(&answer)
            .await
            .unwrap();
        (offerer, answerer)
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let network = MemoryNetwork::new();
        let (mut offerer, mut answerer) = connected_pair(&network).await;

        for handle in [&mut offerer, &mut answerer] {
            let events = drain(&mut handle.events);
            assert_eq!(events[0], TransportEvent::GatheringComplete);
            assert!(events.contains(&TransportEvent::Connectivity(ConnectivityState::Connected)));
            assert_eq!(events.last(), Some(&TransportEvent::ChannelOpen));
        }

        offerer.transport.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(
            answerer.events.recv().await,
            Some(TransportEvent::Message(b"hello".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_blocked_servers_report_candidate_errors() {
        let network = MemoryNetwork::with_faults(
            FaultPlan::default().block_server("stun:stun.l.google.com:19302"),
        );
        let mut handle = network
            .create(Role::Offerer, &TransportConfig::fallback())
            .await
            .unwrap();
        let descriptor = handle.transport.request_local_descriptor().await.unwrap();

        assert!(!descriptor.sdp.contains("stun.l.google.com"));
        let events = drain(&mut handle.events);
        assert!(matches!(
            &events[0],
            TransportEvent::CandidateError(e) if e.source_url == "stun:stun.l.google.com:19302"
        ));
        assert_eq!(events[1], TransportEvent::GatheringComplete);
    }

    #[tokio::test]
    async fn test_stalled_gathering_never_completes() {
        let network = MemoryNetwork::with_faults(FaultPlan::default().stall_gathering());
        let mut handle = network
            .create(Role::Offerer, &TransportConfig::primary())
            .await
            .unwrap();
        handle.transport.request_local_descriptor().await.unwrap();
        assert!(drain(&mut handle.events).is_empty());
    }

    #[tokio::test]
    async fn test_injected_connection_failure() {
        let network = MemoryNetwork::with_faults(FaultPlan::default().fail_connections(1));
        let (mut offerer, _answerer) = connected_pair(&network).await;

        let events = drain(&mut offerer.events);
        assert!(events.contains(&TransportEvent::Connectivity(ConnectivityState::Failed)));
        assert!(!events.contains(&TransportEvent::ChannelOpen));
        assert!(matches!(
            offerer.transport.send(vec![1]).await,
            Err(TransportError::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_send_limit() {
        let network = MemoryNetwork::with_faults(FaultPlan::default().fail_sends_after(1));
        let (offerer, _answerer) = connected_pair(&network).await;

        offerer.transport.send(vec![1]).await.unwrap();
        assert!(matches!(
            offerer.transport.send(vec![2]).await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_link_failure_notifies_both_sides() {
        let network = MemoryNetwork::with_faults(FaultPlan::default().fail_link_after(1));
        let (mut offerer, mut answerer) = connected_pair(&network).await;
        drain(&mut offerer.events);
        drain(&mut answerer.events);

        offerer.transport.send(vec![1]).await.unwrap();
        assert!(matches!(
            offerer.transport.send(vec![2]).await,
            Err(TransportError::SendFailed(_))
        ));

        let failed = TransportEvent::Connectivity(ConnectivityState::Failed);
        assert_eq!(drain(&mut offerer.events), vec![failed.clone()]);
        assert_eq!(
            drain(&mut answerer.events),
            vec![TransportEvent::Message(vec![1]), failed]
        );
        assert!(matches!(
            offerer.transport.send(vec![3]).await,
            Err(TransportError::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_close_is_delivered_when_queue_is_full() {
        let network = MemoryNetwork::new();
        let (offerer, mut answerer) = connected_pair(&network).await;
        drain(&mut answerer.events);

        for i in 0..EVENT_CAPACITY {
            offerer.transport.send(vec![i as u8]).await.unwrap();
        }
        offerer.transport.close().await;

        for i in 0..EVENT_CAPACITY {
            assert_eq!(
                answerer.events.recv().await,
                Some(TransportEvent::Message(vec![i as u8]))
            );
        }
        assert_eq!(
            answerer.events.recv().await,
            Some(TransportEvent::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_answer_for_other_offer_is_rejected() {
        let network = MemoryNetwork::new();
        let config = TransportConfig::primary();
        let first = network.create(Role::Offerer, &config).await.unwrap();
        let second = network.create(Role::Offerer, &config).await.unwrap();
        let answerer = network.create(Role::Answerer, &config).await.unwrap();

        let offer = first.transport.request_local_descriptor().await.unwrap();
        answerer
            .transport
            .apply_remote_descriptor(&offer)
            .await
            .unwrap();
        let answer = answerer.transport.request_local_descriptor().await.unwrap();

        assert!(matches!(
            second.transport.apply_remote_descriptor(&answer).await,
            Err(TransportError::InvalidDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn test_close_notifies_peer_and_releases_endpoint() {
        let network = MemoryNetwork::new();
        let (offerer, mut answerer) = connected_pair(&network).await;
        drain(&mut answerer.events);
        assert_eq!(network.live_transports().await, 2);

        offerer.transport.close().await;
        offerer.transport.close().await;

        assert_eq!(network.live_transports().await, 1);
        assert_eq!(
            answerer.events.recv().await,
            Some(TransportEvent::ChannelClosed)
        );
        assert!(matches!(
            answerer.transport.send(vec![1]).await,
            Err(TransportError::Closed)
        ));
    }
}
