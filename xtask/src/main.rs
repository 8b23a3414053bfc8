use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Blueseek 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建所有组件 (release)
    Build {
        /// 启用 BlueZ 后端
        #[arg(long)]
        bluez: bool,
    },
    /// 运行测试
    Test,
    /// 回放 demos/scenarios 下的场景
    Replay {
        /// 场景名（不含扩展名），不指定则依次回放全部
        name: Option<String>,
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = std::env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()));
    let project_root = match project_root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build { bluez } => build(&sh, bluez)?,
        Commands::Test => test(&sh)?,
        Commands::Replay { name, log_level } => replay(&sh, name.as_deref(), &log_level)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell, bluez: bool) -> Result<()> {
    println!("🔨 构建所有组件...");
    if bluez {
        cmd!(sh, "cargo build --release -p blueseek-cli --features bluez").run()?;
    } else {
        cmd!(sh, "cargo build --release -p blueseek-cli").run()?;
    }
    println!("✅ 构建完成: target/release/blueseek");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn scenarios(name: Option<&str>) -> Result<Vec<PathBuf>> {
    let dir = PathBuf::from("demos/scenarios");
    if let Some(name) = name {
        for ext in ["json", "toml"] {
            let path = dir.join(format!("{name}.{ext}"));
            if path.exists() {
                return Ok(vec![path]);
            }
        }
        anyhow::bail!("No scenario named '{}' in {}", name, dir.display());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
        .collect();
    paths.sort();
    Ok(paths)
}

fn replay(sh: &Shell, name: Option<&str>, log_level: &str) -> Result<()> {
    for path in scenarios(name)? {
        println!("▶️  {}", path.display());
        cmd!(
            sh,
            "cargo run -q -p blueseek-cli -- --log-level {log_level} replay {path} --timeout 3"
        )
        .run()?;
        println!();
    }
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ 清理完成");
    Ok(())
}
