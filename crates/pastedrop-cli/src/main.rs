//! PasteDrop CLI
//!
//! 命令行工具: 检查令牌和分享链接、管理配置，以及在进程内回环网络上
//! 演示一次完整的发送/接收流程。

mod demo;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pastedrop_core::config::Settings;
use pastedrop_core::signaling::{SignalingPayload, answer_link, offer_link, parse_link};
use pastedrop_core::status::format_size;

#[derive(Parser)]
#[command(name = "pastedrop", version, about = "复制粘贴即可完成的点对点文件传输")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 令牌与分享链接
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// 在进程内回环网络上演示一次完整传输
    Demo(demo::DemoArgs),
    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// 解码令牌或分享链接并显示内容
    Inspect {
        /// 令牌或完整链接
        input: String,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 为令牌生成分享链接
    Link {
        /// 令牌或已有链接
        input: String,
        /// 链接的基础地址 (默认使用配置中的 share_base_url)
        #[arg(short, long)]
        base: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 显示当前配置
    Show,
    /// 显示配置文件路径
    Path,
    /// 恢复默认配置
    Reset,
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（pastedrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if verbose {
        "debug"
    } else {
        "info,pastedrop_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load();
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Token { action } => match action {
            TokenAction::Inspect { input, json } => inspect_token(&input, json)?,
            TokenAction::Link { input, base } => {
                let base = base.unwrap_or_else(|| settings.share_base_url.clone());
                print_link(&input, &base)?;
            }
        },
        Commands::Demo(args) => demo::run(args, &settings).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", toml::to_string_pretty(&settings)?),
            ConfigAction::Path => println!("{}", Settings::config_path().display()),
            ConfigAction::Reset => {
                Settings::default().save()?;
                println!("✅ 已恢复默认配置: {}", Settings::config_path().display());
            }
        },
    }

    Ok(())
}

fn inspect_token(input: &str, json: bool) -> Result<()> {
    let payload = parse_link(input)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let sdp = &payload.descriptor().sdp;
    println!("类型: {}", payload.kind());
    println!("描述长度: {} 字节", sdp.len());
    println!(
        "候选数: {}",
        sdp.lines().filter(|l| l.starts_with("a=candidate")).count()
    );

    if let SignalingPayload::Offer(offer) = &payload {
        println!(
            "文件: {} ({})",
            offer.manifest.name,
            format_size(offer.manifest.size)
        );
        println!("MIME: {}", offer.manifest.effective_mime_type());
    }
    Ok(())
}

fn print_link(input: &str, base: &str) -> Result<()> {
    let token = pastedrop_core::signaling::extract_token(input)?;
    let link = match parse_link(&token)? {
        SignalingPayload::Offer(_) => offer_link(base, &token)?,
        SignalingPayload::Answer(_) => answer_link(base, &token)?,
    };
    println!("{}", link);
    Ok(())
}
