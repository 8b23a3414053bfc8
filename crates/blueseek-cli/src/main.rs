//! Blueseek CLI
//!
//! 命令行客户端：运行一次蓝牙设备发现，实时打印事件和最终设备列表

mod report;

use anyhow::{Context, Result};
use blueseek_core::config::ScanSettings;
use blueseek_core::platform::scripted::ScriptedPlatform;
use blueseek_core::{
    BluetoothPlatform, DiscoveryCoordinator, DiscoveryEvent, DiscoveryMethods, LogLevel,
};
use clap::{Parser, Subcommand};
use report::{Outcome, ScanReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blueseek", version, about = "Bluetooth classic + LE device discovery")]
struct Cli {
    /// 日志级别 (error, warn, info, debug, trace)；RUST_LOG 优先
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备 (BlueZ)
    Scan {
        /// 发现已配对的经典设备
        #[arg(long)]
        classic: bool,
        /// 发现 LE 设备（已配对 + 广播）
        #[arg(long)]
        le: bool,
        /// LE 超时时间 (秒)，0 表示一直运行到 Ctrl-C
        #[arg(short, long)]
        timeout: Option<u64>,
        /// 适配器名称，如 hci0
        #[arg(short, long)]
        adapter: Option<String>,
        /// 以 JSON 输出最终设备列表
        #[arg(long)]
        json: bool,
    },
    /// 回放一个脚本化场景 (.json / .toml)
    Replay {
        scenario: PathBuf,
        #[arg(long)]
        classic: bool,
        #[arg(long)]
        le: bool,
        #[arg(short, long)]
        timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// 查看或初始化配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前生效的配置
    Show,
    /// 打印配置文件路径
    Path,
    /// 写入默认配置
    Init {
        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },
}

/// 一次运行的参数
struct RunOptions {
    methods: DiscoveryMethods,
    le_timeout: Option<Duration>,
    json: bool,
}

impl RunOptions {
    fn resolve(
        settings: &ScanSettings,
        classic: bool,
        le: bool,
        timeout: Option<u64>,
        json: bool,
    ) -> Self {
        let methods = if classic || le {
            let mut methods = DiscoveryMethods::empty();
            methods.set(DiscoveryMethods::CLASSIC, classic);
            methods.set(DiscoveryMethods::LOW_ENERGY, le);
            methods
        } else {
            settings.methods()
        };
        let le_timeout = match timeout {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => settings.le_timeout(),
        };
        Self {
            methods,
            le_timeout,
            json,
        }
    }
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（blueseek-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = ScanSettings::load();
    init_logging(cli.log_level.unwrap_or(settings.log_level));

    match cli.command {
        Commands::Scan {
            classic,
            le,
            timeout,
            adapter,
            json,
        } => {
            let options = RunOptions::resolve(&settings, classic, le, timeout, json);
            let adapter = adapter.or_else(|| settings.adapter.clone());
            scan(adapter, options).await?;
        }
        Commands::Replay {
            scenario,
            classic,
            le,
            timeout,
            json,
        } => {
            let options = RunOptions::resolve(&settings, classic, le, timeout, json);
            let platform = ScriptedPlatform::from_path(&scenario)?;
            tracing::info!("Replaying scenario {:?}", scenario);
            run(Arc::new(platform), options).await?;
        }
        Commands::Config { action } => config(action, &settings)?,
    }

    Ok(())
}

#[cfg(feature = "bluez")]
async fn scan(adapter: Option<String>, options: RunOptions) -> Result<()> {
    let platform = blueseek_core::platform::bluez::BluezPlatform::new(adapter.as_deref())
        .await
        .context("Failed to connect to BlueZ")?;
    run(Arc::new(platform), options).await
}

#[cfg(not(feature = "bluez"))]
async fn scan(_adapter: Option<String>, _options: RunOptions) -> Result<()> {
    anyhow::bail!("blueseek was built without BlueZ support; rebuild with `--features bluez`")
}

async fn run<P: BluetoothPlatform>(platform: Arc<P>, options: RunOptions) -> Result<()> {
    let (coordinator, mut events) = DiscoveryCoordinator::new(platform);

    if !options.json {
        println!(
            "🔍 Discovering ({:?}, LE timeout: {})...",
            options.methods,
            options
                .le_timeout
                .map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs()))
        );
    }
    coordinator
        .start(options.methods, options.le_timeout)
        .await
        .context("Discovery could not start")?;

    let stopper = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping discovery");
            stopper.stop();
        }
    });

    let mut errors = Vec::new();
    let mut outcome = Outcome::Canceled;
    while let Some(event) = events.recv().await {
        if !options.json {
            report::print_event(&event);
        }
        match event {
            DiscoveryEvent::ErrorOccurred(kind) => errors.push(kind),
            DiscoveryEvent::Finished => {
                outcome = Outcome::Finished;
                break;
            }
            DiscoveryEvent::Canceled => break,
            _ => {}
        }
    }

    let devices = coordinator.current_devices();
    if options.json {
        let report = ScanReport {
            outcome,
            errors,
            devices,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report::print_devices(&devices);
    }
    Ok(())
}

fn config(action: ConfigAction, settings: &ScanSettings) -> Result<()> {
    match action {
        ConfigAction::Show => print!("{}", toml::to_string_pretty(settings)?),
        ConfigAction::Path => println!("{}", ScanSettings::config_path().display()),
        ConfigAction::Init { force } => {
            let path = ScanSettings::config_path();
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let path = ScanSettings::default().save()?;
            println!("Wrote default settings to {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_configured_methods() {
        let settings = ScanSettings::default();
        let options = RunOptions::resolve(&settings, false, true, Some(0), false);
        assert_eq!(options.methods, DiscoveryMethods::LOW_ENERGY);
        assert_eq!(options.le_timeout, None);
    }

    #[test]
    fn test_defaults_come_from_settings() {
        let settings = ScanSettings {
            classic: false,
            le_timeout_ms: 2_500,
            ..Default::default()
        };
        let options = RunOptions::resolve(&settings, false, false, None, true);
        assert_eq!(options.methods, DiscoveryMethods::LOW_ENERGY);
        assert_eq!(options.le_timeout, Some(Duration::from_millis(2_500)));
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "blueseek",
            "--log-level",
            "debug",
            "replay",
            "demos/scenarios/mixed.json",
            "--timeout",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert!(matches!(cli.command, Commands::Replay { timeout: Some(3), .. }));
    }
}
