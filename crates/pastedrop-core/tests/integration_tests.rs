//! 集成测试 - 通过进程内回环传输跑完整流程
//!
//! 覆盖令牌交换、连接建立、重试、候选诊断以及文件收发。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pastedrop_core::config::{Settings, TransportConfig};
use pastedrop_core::negotiator::{
    AnswerDisposition, Negotiator, NegotiatorError, NegotiatorEvent, NegotiatorState,
};
use pastedrop_core::signaling::{FileManifest, decode_offer};
use pastedrop_core::status::{NullSink, Severity, StatusSink};
use pastedrop_core::transfer::{DirectoryPersistence, TransferError};
use pastedrop_core::transport::{DataChannel, FaultPlan, MemoryNetwork, Role};
use pastedrop_core::workflow::{
    ReceiveEvent, ReceiveOptions, ReceiveSession, SendEvent, SendOptions, SendSession,
    SimpleReceiveCallback, SimpleSendCallback,
};

/// 重试间隔缩短到毫秒级的设置
fn fast_settings(download_dir: &Path) -> Settings {
    Settings {
        download_dir: download_dir.to_path_buf(),
        retry_backoff_ms: 10,
        gathering_timeout_secs: 1,
        ..Default::default()
    }
}

fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Default)]
struct RecordingStatus(Mutex<Vec<(Severity, String)>>);

impl StatusSink for RecordingStatus {
    fn on_status(&self, message: &str, severity: Severity) {
        self.0.lock().unwrap().push((severity, message.to_string()));
    }
}

impl RecordingStatus {
    fn messages(&self, severity: Severity) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

struct Pair {
    sender: SendSession<MemoryNetwork, SimpleSendCallback>,
    send_events: tokio::sync::mpsc::Receiver<SendEvent>,
    receiver: ReceiveSession<MemoryNetwork, SimpleReceiveCallback>,
    receive_events: tokio::sync::mpsc::Receiver<ReceiveEvent>,
}

fn session_pair(network: &MemoryNetwork, settings: &Settings) -> Pair {
    let (send_callback, send_events) = SimpleSendCallback::new();
    let (receive_callback, receive_events) = SimpleReceiveCallback::new();
    Pair {
        sender: SendSession::new(
            network.clone(),
            SendOptions::from(settings),
            Arc::new(send_callback),
        ),
        send_events,
        receiver: ReceiveSession::new(
            network.clone(),
            ReceiveOptions::from(settings),
            Arc::new(DirectoryPersistence::new(&settings.download_dir)),
            Arc::new(receive_callback),
        ),
        receive_events,
    }
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// 完整流程: offer 链接 → answer 回传链接 → 分块传输 → 保存
#[tokio::test]
async fn test_end_to_end_transfer() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();
    let data = sample_bytes(40_000);
    let source = write_source(source_dir.path(), "photo.jpg", &data);

    let settings = fast_settings(download_dir.path());
    let network = MemoryNetwork::new();
    let Pair {
        mut sender,
        mut send_events,
        mut receiver,
        mut receive_events,
    } = session_pair(&network, &settings);

    // 1. 发送方生成 offer 链接
    let offer = sender.offer(&source).await.unwrap();
    let offer_link = offer.link.clone().unwrap();
    assert!(offer_link.starts_with(&settings.share_base_url));

    // 2. 接收方打开链接，得到 answer 回传链接
    let answer = receiver.accept_offer(&offer_link).await.unwrap();
    assert!(answer.shareable().contains("#answer="));

    // 3. 发送方粘贴回传链接
    assert_eq!(
        sender.accept_answer(answer.shareable()).await.unwrap(),
        AnswerDisposition::Applied
    );

    // 4. 双方同时运行
    let (sent, received) = tokio::join!(sender.run(), receiver.run());
    let summary = sent.unwrap();
    let saved = received.unwrap();

    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.bytes, 40_000);
    assert_eq!(saved, download_dir.path().join("photo.jpg"));
    assert_eq!(std::fs::read(&saved).unwrap(), data);
    assert_eq!(sender.negotiator().state(), NegotiatorState::Connected);

    // 接收进度: 三条消息各一次，只有最后一次达到 1.0
    let mut fractions = Vec::new();
    let mut completed = None;
    while let Ok(event) = receive_events.try_recv() {
        match event {
            ReceiveEvent::Progress(f) => fractions.push(f),
            ReceiveEvent::Complete(path) => completed = Some(path),
            _ => {}
        }
    }
    assert_eq!(fractions.len(), 3);
    assert!(fractions[..2].iter().all(|f| *f < 1.0));
    assert!((fractions[2] - 1.0).abs() < f64::EPSILON);
    assert_eq!(completed, Some(saved));

    let mut sender_completed = false;
    while let Ok(event) = send_events.try_recv() {
        if let SendEvent::Complete(s) = event {
            assert_eq!(s, summary);
            sender_completed = true;
        }
    }
    assert!(sender_completed);

    sender.close().await;
    receiver.close().await;
    assert_eq!(network.live_transports().await, 0);
}

/// 空文件: 通道打开即完成，不等待任何消息
#[tokio::test]
async fn test_empty_file_transfer() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();
    let source = write_source(source_dir.path(), "empty.txt", b"");

    let settings = fast_settings(download_dir.path());
    let network = MemoryNetwork::new();
    let Pair {
        mut sender,
        mut receiver,
        ..
    } = session_pair(&network, &settings);

    let offer = sender.offer(&source).await.unwrap();
    let answer = receiver.accept_offer(&offer.token).await.unwrap();
    sender.accept_answer(&answer.token).await.unwrap();

    let (sent, received) = tokio::join!(sender.run(), receiver.run());
    assert_eq!(sent.unwrap().chunks, 0);

    let saved = received.unwrap();
    assert_eq!(saved.file_name().unwrap(), "empty.txt");
    assert!(std::fs::read(&saved).unwrap().is_empty());
}

/// 格式错误的令牌不改变任何状态
#[tokio::test]
async fn test_malformed_tokens_leave_sessions_idle() {
    let download_dir = tempfile::tempdir().unwrap();
    let settings = fast_settings(download_dir.path());
    let network = MemoryNetwork::new();
    let Pair {
        mut sender,
        mut receiver,
        ..
    } = session_pair(&network, &settings);

    assert!(receiver.accept_offer("definitely-not-a-token").await.is_err());
    assert!(receiver.accept_offer("http://localhost:8080/#").await.is_err());
    assert_eq!(receiver.negotiator().state(), NegotiatorState::Idle);

    assert!(sender.accept_answer("%%%").await.is_err());
    assert!(!sender.negotiator().has_pending_answer());
    assert_eq!(sender.negotiator().state(), NegotiatorState::Idle);

    assert!(network.created().await.is_empty());
}

/// 发送中途失败时中止，接收方不保存任何文件
#[tokio::test]
async fn test_chunk_failure_aborts_transfer() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();
    let source = write_source(source_dir.path(), "big.bin", &sample_bytes(50_000));

    let settings = fast_settings(download_dir.path());
    let network = MemoryNetwork::with_faults(FaultPlan::default().fail_sends_after(1));
    let Pair {
        mut sender,
        mut receiver,
        ..
    } = session_pair(&network, &settings);

    let offer = sender.offer(&source).await.unwrap();
    let answer = receiver.accept_offer(&offer.token).await.unwrap();
    sender.accept_answer(&answer.token).await.unwrap();

    let (sent, received) = tokio::join!(
        async {
            let result = sender.run().await;
            sender.close().await;
            result
        },
        receiver.run()
    );

    let error = sent.unwrap_err();
    assert!(matches!(
        error.downcast_ref::<TransferError>(),
        Some(TransferError::ChunkSendFailed { index: 1, .. })
    ));
    assert!(received.is_err());
    assert_eq!(std::fs::read_dir(download_dir.path()).unwrap().count(), 0);
}

/// 数据开始传输后连接失败: 接收方结束会话，不重新生成 answer
#[tokio::test]
async fn test_link_failure_mid_transfer_ends_receive_session() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();
    let source = write_source(source_dir.path(), "big.bin", &sample_bytes(40_000));

    let settings = fast_settings(download_dir.path());
    let network = MemoryNetwork::with_faults(FaultPlan::default().fail_link_after(1));
    let Pair {
        mut sender,
        mut receiver,
        mut receive_events,
        ..
    } = session_pair(&network, &settings);

    let offer = sender.offer(&source).await.unwrap();
    let answer = receiver.accept_offer(&offer.token).await.unwrap();
    sender.accept_answer(&answer.token).await.unwrap();

    let (sent, received) = tokio::join!(
        async {
            let result = sender.run().await;
            sender.close().await;
            result
        },
        receiver.run()
    );

    assert!(matches!(
        sent.unwrap_err().downcast_ref::<TransferError>(),
        Some(TransferError::ChunkSendFailed { index: 1, .. })
    ));
    assert!(matches!(
        received.unwrap_err().downcast_ref::<NegotiatorError>(),
        Some(NegotiatorError::Interrupted)
    ));
    assert_eq!(receiver.negotiator().state(), NegotiatorState::Failed);
    assert_eq!(receiver.negotiator().attempts(), 0);

    let mut tokens = 0;
    let mut progress = Vec::new();
    while let Ok(event) = receive_events.try_recv() {
        match event {
            ReceiveEvent::Token(_) => tokens += 1,
            ReceiveEvent::Progress(f) => progress.push(f),
            _ => {}
        }
    }
    assert_eq!(tokens, 1);
    assert_eq!(progress.len(), 1);
    assert_eq!(std::fs::read_dir(download_dir.path()).unwrap().count(), 0);
    assert_eq!(
        network
            .created()
            .await
            .iter()
            .filter(|(role, _)| *role == Role::Answerer)
            .count(),
        1
    );
}

/// 第一次连接失败后，双方通过收件箱重新交换令牌并完成传输
#[tokio::test]
async fn test_workflow_recovers_through_token_inboxes() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();
    let data = sample_bytes(20_000);
    let source = write_source(source_dir.path(), "retry.bin", &data);

    let settings = fast_settings(download_dir.path());
    let network = MemoryNetwork::with_faults(FaultPlan::default().fail_connections(1));
    let Pair {
        mut sender,
        mut send_events,
        mut receiver,
        mut receive_events,
    } = session_pair(&network, &settings);

    let to_receiver = receiver.token_inbox();
    let to_sender = sender.token_inbox();

    // 模拟用户在两端之间转交令牌
    let offers = tokio::spawn(async move {
        let mut count = 0;
        while let Some(event) = send_events.recv().await {
            if let SendEvent::Token(share) = event {
                count += 1;
                let _ = to_receiver.send(share.shareable().to_string()).await;
            }
        }
        count
    });
    let answers = tokio::spawn(async move {
        while let Some(event) = receive_events.recv().await {
            if let ReceiveEvent::Token(share) = event {
                let _ = to_sender.send(share.shareable().to_string()).await;
            }
        }
    });

    sender.offer(&source).await.unwrap();
    let (sent, received) = tokio::join!(sender.run(), receiver.run());

    assert_eq!(sent.unwrap().bytes, 20_000);
    assert_eq!(std::fs::read(received.unwrap()).unwrap(), data);
    assert_eq!(sender.negotiator().attempts(), 1);

    let created = network.created().await;
    let last_offerer = created
        .iter()
        .rev()
        .find(|(role, _)| *role == Role::Offerer)
        .map(|(_, label)| label.as_str());
    assert_eq!(last_offerer, Some("fallback"));

    drop(sender);
    drop(receiver);
    assert_eq!(offers.await.unwrap(), 2);
    answers.await.unwrap();
}

/// 协商器层面: 每次失败后重新交换，直到次数用尽
#[tokio::test]
async fn test_retry_exhaustion_reports_guidance() {
    let network = MemoryNetwork::with_faults(FaultPlan::default().fail_connections(3));
    let settings = fast_settings(Path::new("."));
    let status = Arc::new(RecordingStatus::default());

    let mut offerer = Negotiator::new(network.clone(), settings.negotiation(), status.clone());
    let mut answerer = Negotiator::new(network.clone(), settings.negotiation(), Arc::new(NullSink));

    let mut offer = offerer
        .create_session(FileManifest::new("a.bin", 10, ""))
        .await
        .unwrap();

    for attempt in 1..=2 {
        answerer.apply_offer(decode_offer(&offer).unwrap()).unwrap();
        let answer = answerer.produce_answer().await.unwrap();
        offerer.submit_answer(&answer).await.unwrap();

        match offerer.next_event().await {
            Some(NegotiatorEvent::Retrying { attempt: a, token }) => {
                assert_eq!(a, attempt);
                offer = token;
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            answerer.next_event().await,
            Some(NegotiatorEvent::Retrying { .. })
        ));
        assert_eq!(offerer.role(), Some(Role::Offerer));
        assert_eq!(answerer.role(), Some(Role::Answerer));
    }

    answerer.apply_offer(decode_offer(&offer).unwrap()).unwrap();
    let answer = answerer.produce_answer().await.unwrap();
    offerer.submit_answer(&answer).await.unwrap();

    assert_eq!(
        offerer.next_event().await,
        Some(NegotiatorEvent::Failed { attempts: 3 })
    );
    assert_eq!(
        answerer.next_event().await,
        Some(NegotiatorEvent::Failed { attempts: 3 })
    );
    assert_eq!(offerer.state(), NegotiatorState::Failed);
    assert_eq!(offerer.next_event().await, None);

    let errors = status.messages(Severity::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("可以尝试"));

    let offerer_labels: Vec<String> = network
        .created()
        .await
        .into_iter()
        .filter(|(role, _)| *role == Role::Offerer)
        .map(|(_, label)| label)
        .collect();
    assert_eq!(offerer_labels, vec!["primary", "fallback", "fallback"]);
    assert_eq!(network.live_transports().await, 0);
}

/// 服务器全部不可达时提示一次，连接成功后清除
#[tokio::test]
async fn test_blocked_servers_raise_single_advisory() {
    let primary = TransportConfig::primary();
    let network = MemoryNetwork::with_faults(FaultPlan::default().block_all_servers(&primary));
    let settings = fast_settings(Path::new("."));
    let status = Arc::new(RecordingStatus::default());

    let mut offerer = Negotiator::new(network.clone(), settings.negotiation(), status.clone());
    let mut answerer = Negotiator::new(network.clone(), settings.negotiation(), Arc::new(NullSink));

    let offer = offerer
        .create_session(FileManifest::new("a.bin", 3, ""))
        .await
        .unwrap();
    assert!(offerer.diagnostics().should_warn());

    answerer.apply_offer(decode_offer(&offer).unwrap()).unwrap();
    let answer = answerer.produce_answer().await.unwrap();
    offerer.submit_answer(&answer).await.unwrap();

    let mut advisories = 0;
    loop {
        match offerer.next_event().await {
            Some(NegotiatorEvent::Advisory(advisory)) => {
                assert_eq!(advisory.failure_count, 4);
                advisories += 1;
            }
            Some(NegotiatorEvent::Connected) => break,
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(advisories, 1);
    assert!(offerer.advisory().is_none());
    assert_eq!(
        offerer.diagnostics().failures().len(),
        primary.server_urls().count()
    );
    assert_eq!(status.messages(Severity::Warn).len(), 1);

    // 通道仍然可用
    assert_eq!(offerer.next_event().await, Some(NegotiatorEvent::ChannelOpen));
    offerer.channel().unwrap().send(b"ping".to_vec()).await.unwrap();
    loop {
        match answerer.next_event().await {
            Some(NegotiatorEvent::Message(data)) => {
                assert_eq!(data, b"ping");
                break;
            }
            Some(_) => continue,
            None => panic!("answerer stream ended"),
        }
    }
}
