use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_log_feed::common::one_line_preview;
use relay_log_feed::log_feed::{FeedController, FeedOptions, FeedSnapshot, HttpLogApi, LogApi};
use relay_log_feed::model::config::Config;
use relay_log_feed::model::record::LogRecord;

/// 网关请求日志终端查看器
#[derive(Parser)]
#[command(name = "relay-log-feed", version)]
#[command(about = "Follow the request log of an LLM relay gateway")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value_t = Config::default_config_path().to_string())]
    config: String,

    /// 覆盖配置中的网关地址
    #[arg(long)]
    base_url: Option<String>,

    /// 覆盖配置中的 API Key
    #[arg(long)]
    api_key: Option<String>,

    /// 覆盖配置中的每页条数
    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 输出历史日志并持续跟随实时日志（默认）
    Tail {
        /// 启动时加载的历史页数
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// 清空服务端全部日志
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 日志输出到 stderr，stdout 只留给日志记录本身
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("加载配置文件失败: {}", args.config))?;
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(api_key) = args.api_key {
        config.api_key = Some(api_key);
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }

    tracing::info!("网关地址: {}", config.api_root());
    let api = HttpLogApi::new(&config)?;

    match args.command.unwrap_or(Command::Tail { pages: 1 }) {
        Command::Tail { pages } => tail(api, FeedOptions::from_config(&config), pages).await,
        Command::Purge => {
            api.purge().await.context("清空服务端日志失败")?;
            println!("服务端日志已清空");
            Ok(())
        }
    }
}

async fn tail(api: HttpLogApi, options: FeedOptions, pages: u32) -> anyhow::Result<()> {
    let controller = FeedController::start(Arc::new(api), options);
    let mut state = controller.subscribe();
    let mut printed: HashSet<i64> = HashSet::new();
    let mut requested_pages = 1;
    let mut last_error = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("收到 Ctrl+C，正在退出");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let snapshot = state.borrow_and_update().clone();
        print_new_records(&snapshot, &mut printed);

        if snapshot.error != last_error {
            if let Some(error) = &snapshot.error {
                tracing::warn!("{}", error);
            }
            last_error = snapshot.error.clone();
        }

        if snapshot.connection.is_terminal() && !snapshot.is_loading && !snapshot.is_loading_more {
            tracing::error!("实时日志流已结束，退出");
            break;
        }

        if requested_pages < pages
            && snapshot.has_more
            && !snapshot.is_loading
            && !snapshot.is_loading_more
            && snapshot.error.is_none()
        {
            requested_pages += 1;
            controller.load_more();
        }
    }

    controller.shutdown().await;
    Ok(())
}

/// 按时间正序输出尚未输出过的日志
fn print_new_records(snapshot: &FeedSnapshot, printed: &mut HashSet<i64>) {
    for record in snapshot.records.iter().rev() {
        if printed.insert(record.id) {
            println!("{}", format_record(record));
        }
    }
}

fn format_record(record: &LogRecord) -> String {
    let time = record
        .datetime()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| record.timestamp.to_string());

    let mut line = format!(
        "{} #{} [{}#{}] {} -> {} tokens={} ({}/{}) ftut={}ms total={}ms cost={:.6}",
        time,
        record.id,
        record.channel_name,
        record.channel_id,
        record.request_model_name,
        record.actual_model_name,
        record.total_tokens(),
        record.input_tokens,
        record.output_tokens,
        record.first_token_latency_ms,
        record.total_latency_ms,
        record.cost,
    );
    if let Some(error) = &record.error {
        line.push_str(&format!(" error={}", one_line_preview(error, 200)));
    }
    line
}
