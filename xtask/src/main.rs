use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "PasteDrop 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建 CLI (release)
    Build,
    /// 运行测试
    Test,
    /// 运行 clippy 和格式检查
    Lint,
    /// 在回环网络上演示一次传输
    Demo {
        /// 要发送的文件 (默认发送 Cargo.toml)
        #[arg(default_value = "Cargo.toml")]
        file: String,
        /// 让前 N 次连接失败，观察重试
        #[arg(long, default_value = "0")]
        fail_first: u32,
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },
    /// 运行测试并生成覆盖率报告
    Coverage,
    /// 打包发布 (tar.gz)
    Dist,
    /// 清理构建产物
    Clean,
}

fn project_root() -> Result<PathBuf> {
    match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => Ok(PathBuf::from(dir)
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default()),
        Err(_) => Ok(std::env::current_dir()?),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    sh.change_dir(project_root()?);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Test => test(&sh)?,
        Commands::Lint => lint(&sh)?,
        Commands::Demo {
            file,
            fail_first,
            log_level,
        } => demo(&sh, &file, fail_first, &log_level)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Dist => dist(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建 pastedrop...");
    cmd!(sh, "cargo build --release -p pastedrop-cli").run()?;
    println!("✅ 构建完成: target/release/pastedrop");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn lint(sh: &Shell) -> Result<()> {
    println!("🔍 代码检查...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    cmd!(sh, "cargo clippy --workspace --all-targets").run()?;
    println!("✅ 检查通过");
    Ok(())
}

fn demo(sh: &Shell, file: &str, fail_first: u32, log_level: &str) -> Result<()> {
    let output = "target/demo-downloads";
    let fail_first = fail_first.to_string();
    let rust_log = format!("{level},pastedrop_core={level}", level = log_level);

    println!("🎬 回环演示: {}", file);
    println!("   保存目录: {}", output);

    let _env = sh.push_env("RUST_LOG", rust_log);
    cmd!(
        sh,
        "cargo run -p pastedrop-cli -- demo {file} --output {output} --fail-first {fail_first}"
    )
    .run()?;
    Ok(())
}

fn coverage(sh: &Shell) -> Result<()> {
    println!("📊 运行测试覆盖率分析...");

    // 检查 cargo-tarpaulin 是否安装
    if cmd!(sh, "cargo tarpaulin --version").run().is_err() {
        println!("📦 安装 cargo-tarpaulin...");
        cmd!(sh, "cargo install cargo-tarpaulin").run()?;
    }

    println!("🔍 分析中...");
    cmd!(
        sh,
        "cargo tarpaulin --packages pastedrop-core --out Html --output-dir target/coverage"
    )
    .run()?;

    println!("✅ 覆盖率报告已生成");
    println!("   HTML 报告: target/coverage/tarpaulin-report.html");
    Ok(())
}

fn dist(sh: &Shell) -> Result<()> {
    println!("📦 打包发布...");

    build(sh)?;

    let version = env!("CARGO_PKG_VERSION");
    let dist_name = format!("pastedrop-{}-{}", version, std::env::consts::ARCH);

    cmd!(sh, "mkdir -p dist/{dist_name}").run()?;
    cmd!(sh, "cp target/release/pastedrop dist/{dist_name}/").run()?;
    if sh.path_exists("README.md") {
        cmd!(sh, "cp README.md dist/{dist_name}/").run()?;
    }

    sh.change_dir("dist");
    cmd!(sh, "tar -czvf {dist_name}.tar.gz {dist_name}").run()?;

    println!("✅ 打包完成: dist/{}.tar.gz", dist_name);
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    cmd!(sh, "rm -rf dist").run()?;
    println!("✅ 清理完成");
    Ok(())
}
