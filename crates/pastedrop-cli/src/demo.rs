//! 回环演示
//!
//! 发送方和接收方运行在同一进程，令牌通过收件箱自动转交，
//! 可以注入故障观察重试、候选诊断和排查说明。

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use pastedrop_core::config::Settings;
use pastedrop_core::status::format_size;
use pastedrop_core::transfer::DirectoryPersistence;
use pastedrop_core::transport::{FaultPlan, MemoryNetwork};
use pastedrop_core::workflow::{
    ReceiveEvent, ReceiveOptions, ReceiveSession, SendEvent, SendOptions, SendSession,
    SimpleReceiveCallback, SimpleSendCallback,
};

#[derive(Args)]
pub struct DemoArgs {
    /// 要发送的文件
    file: PathBuf,
    /// 保存目录 (默认: 配置中的 download_dir)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// 让前 N 次连接失败
    #[arg(long, default_value = "0")]
    fail_first: u32,
    /// 发送 N 个分块后让连接中断
    #[arg(long)]
    fail_link_after: Option<usize>,
    /// 屏蔽指定的 STUN/TURN 地址，可重复
    #[arg(long)]
    block_server: Vec<String>,
    /// 屏蔽配置中的全部服务器
    #[arg(long)]
    block_all: bool,
    /// 整个演示的超时时间 (秒)
    #[arg(long, default_value = "60")]
    timeout: u64,
}

impl DemoArgs {
    fn fault_plan(&self, settings: &Settings) -> FaultPlan {
        let mut faults = FaultPlan::default().fail_connections(self.fail_first);
        if let Some(count) = self.fail_link_after {
            faults = faults.fail_link_after(count);
        }
        for url in &self.block_server {
            faults = faults.block_server(url.clone());
        }
        if self.block_all {
            for config in &settings.transports {
                faults = faults.block_all_servers(config);
            }
        }
        faults
    }
}

/// 打印发送方事件，并把新的 offer 交给接收方
async fn relay_send_events(mut events: mpsc::Receiver<SendEvent>, to_receiver: mpsc::Sender<String>) {
    while let Some(event) = events.recv().await {
        match event {
            SendEvent::Status(entry) => println!("发送方 | {}", entry),
            SendEvent::Token(share) => {
                println!("发送方 | 🔗 {}", share.shareable());
                if to_receiver.send(share.token).await.is_err() {
                    tracing::debug!("Receiver inbox closed, dropping offer");
                }
            }
            SendEvent::Progress(fraction) => println!("发送方 | {:.1}%", fraction * 100.0),
            SendEvent::Complete(summary) => println!(
                "发送方 | 共 {} 块，{}",
                summary.chunks,
                format_size(summary.bytes)
            ),
            SendEvent::Error(error) => println!("发送方 | ❌ {}", error),
        }
    }
}

/// 打印接收方事件，并把 answer 交回发送方
async fn relay_receive_events(
    mut events: mpsc::Receiver<ReceiveEvent>,
    to_sender: mpsc::Sender<String>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ReceiveEvent::Status(entry) => println!("接收方 | {}", entry),
            ReceiveEvent::Offer(manifest) => println!(
                "接收方 | 📄 {} ({}, {})",
                manifest.name,
                format_size(manifest.size),
                manifest.effective_mime_type()
            ),
            ReceiveEvent::Token(share) => {
                println!("接收方 | 🔗 {}", share.shareable());
                if to_sender.send(share.token).await.is_err() {
                    tracing::debug!("Sender inbox closed, dropping answer");
                }
            }
            ReceiveEvent::Progress(fraction) => println!("接收方 | {:.1}%", fraction * 100.0),
            ReceiveEvent::Complete(path) => println!("接收方 | 📁 {}", path.display()),
            ReceiveEvent::Error(error) => println!("接收方 | ❌ {}", error),
        }
    }
}

pub async fn run(args: DemoArgs, settings: &Settings) -> Result<()> {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| settings.download_dir.clone());
    let network = MemoryNetwork::with_faults(args.fault_plan(settings));

    let (send_callback, send_events) = SimpleSendCallback::new();
    let (receive_callback, receive_events) = SimpleReceiveCallback::new();
    let mut sender = SendSession::new(
        network.clone(),
        SendOptions::from(settings),
        Arc::new(send_callback),
    );
    let mut receiver = ReceiveSession::new(
        network.clone(),
        ReceiveOptions::from(settings),
        Arc::new(DirectoryPersistence::new(&output)),
        Arc::new(receive_callback),
    );

    let send_log = tokio::spawn(relay_send_events(send_events, receiver.token_inbox()));
    let receive_log = tokio::spawn(relay_receive_events(receive_events, sender.token_inbox()));

    tracing::info!("Starting loopback demo for {}", args.file.display());
    sender.offer(&args.file).await?;

    let outcome = tokio::time::timeout(Duration::from_secs(args.timeout), async {
        tokio::join!(
            async {
                let result = sender.run().await;
                if result.is_err() {
                    // 让接收方尽快结束
                    sender.close().await;
                }
                result
            },
            receiver.run()
        )
    })
    .await;

    sender.close().await;
    receiver.close().await;
    drop(sender);
    drop(receiver);
    let _ = tokio::join!(send_log, receive_log);

    let (sent, received) = outcome.context("Demo timed out")?;
    let summary = sent?;
    let path = received?;

    println!();
    println!(
        "✅ 已传输 {} ({} 块) → {}",
        format_size(summary.bytes),
        summary.chunks,
        path.display()
    );
    Ok(())
}
