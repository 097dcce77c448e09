//! ViBeBiTeS CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示收发与好友功能
//! 启动时通过命令行参数指定账号（或本地用户），自动登录，打印好友列表与会话事件

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use vibebites_core::im::auth::{AuthClient, Session};
use vibebites_core::im::client::{ClientConfig, VibeClient};
use vibebites_core::im::conversation::ConversationListener;
use vibebites_core::im::friend::FriendListener;
use vibebites_core::im::message::LocalMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// 本地 SQLite，无需账号
    Local,
    /// 托管后端（REST + 实时推送）
    Remote,
}

/// ViBeBiTeS CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "vibebites-cli")]
#[command(about = "ViBeBiTeS CLI 客户端 - 用于测试和展示收发功能", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "local")]
    mode: Mode,

    /// 后端地址
    #[arg(long, env = "VIBEBITES_URL", default_value = "http://localhost:54321")]
    base_url: String,

    /// 后端匿名 key
    #[arg(long, env = "VIBEBITES_ANON_KEY", default_value = "")]
    anon_key: String,

    /// 登录邮箱（remote 模式）
    #[arg(long, env = "VIBEBITES_EMAIL")]
    email: Option<String>,

    /// 登录密码（remote 模式）
    #[arg(long, env = "VIBEBITES_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// 本地用户 ID（local 模式）
    #[arg(short, long, default_value = "local-player")]
    user: String,

    /// 本地数据库（local 模式）
    #[arg(long, default_value = "sqlite://vibebites.db?mode=rwc")]
    db_url: String,

    /// 生成器 API key，不设置时使用默认表情
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    generator_key: Option<String>,

    /// 先通过邀请码添加好友
    #[arg(long)]
    add: Option<String>,

    /// 打开与该好友（用户 ID）的会话
    #[arg(short, long)]
    friend: Option<String>,

    /// 打开会话后发送一条消息
    #[arg(short, long)]
    send: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,vibebites_core=debug）
    #[arg(long, default_value = "info,vibebites_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 追加模式
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

struct CliConversationListener;

#[async_trait::async_trait]
impl ConversationListener for CliConversationListener {
    async fn on_messages_changed(&self, friend_id: String, messages: Vec<LocalMessage>) {
        info!("[CLI/Conversation] 🔄 {} 条消息 (friend={})", messages.len(), friend_id);
        if let Some(last) = messages.last() {
            info!(
                "[CLI/Conversation]   最新: {} {} [{}] {:?}",
                last.emojis.join(""),
                last.text,
                last.status.as_str(),
                last.kind
            );
        }
    }

    async fn on_scroll_to_latest(&self, friend_id: String) {
        info!("[CLI/Conversation] ⬇️ 滚动到底部 (friend={})", friend_id);
    }

    async fn on_send_failed(&self, friend_id: String, local_id: String, error: String) {
        error!(
            "[CLI/Conversation] ❌ 发送失败 (friend={}, local_id={}): {}",
            friend_id, local_id, error
        );
    }

    async fn on_messages_read(&self, friend_id: String, count: u64) {
        info!("[CLI/Conversation] 📖 已读 {} 条 (friend={})", count, friend_id);
    }
}

struct CliFriendListener;

#[async_trait::async_trait]
impl FriendListener for CliFriendListener {
    async fn on_friend_list_changed(&self, friends_json: String) {
        info!("[CLI/Friend] 👥 好友列表变更: {}", friends_json);
    }

    async fn on_unread_count_changed(&self, friend_id: String, unread_count: usize) {
        info!("[CLI/Friend] 📬 未读数变更: {} → {}", friend_id, unread_count);
    }
}

async fn connect(args: &Args, config: ClientConfig) -> Result<VibeClient> {
    match args.mode {
        Mode::Local => {
            let client = VibeClient::connect_local(config)
                .await?
                .with_friend_listener(Arc::new(CliFriendListener))
                .with_conversation_listener(Arc::new(CliConversationListener));
            client.on_signed_in(Session::local(args.user.clone(), None)).await;
            Ok(client)
        }
        Mode::Remote => {
            let email = args.email.as_deref().context("remote 模式需要 --email")?;
            let password = args.password.as_deref().context("remote 模式需要 --password")?;
            let auth = AuthClient::new(&config.base_url, &config.anon_key)?;
            let session = auth.sign_in_with_password(email, password).await?;
            // 监听器需要在加载好友前注册
            let client = VibeClient::connect_rest(config, &session)
                .await?
                .with_friend_listener(Arc::new(CliFriendListener))
                .with_conversation_listener(Arc::new(CliConversationListener));
            client.on_signed_in(session).await;
            Ok(client)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 ViBeBiTeS CLI 客户端（测试模式）");
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::with_backend(&args.base_url, &args.anon_key);
    config.db_url = args.db_url.clone();
    config.generator_api_key = args.generator_key.clone();

    let client = connect(&args, config).await?;

    let state = client.state().await;
    info!(
        "[CLI] ✅ 已登录: {} ({})",
        state.username().unwrap_or("?"),
        client.invite_code().await.unwrap_or_default()
    );

    if let Some(code) = &args.add {
        match client.add_friend(code).await {
            Ok(friend) => info!("[CLI] ➕ 已添加好友: {} ({})", friend.name, friend.id),
            Err(e) => error!("[CLI] ❌ 添加好友失败: {:#}", e),
        }
    }

    let state = client.state().await;
    info!("[CLI] 👥 好友列表（共 {} 个）:", state.friends.len());
    for friend in state.friends.iter() {
        info!(
            "[CLI]   - {} | {} | 未读: {}",
            friend.name, friend.id, friend.unread_count
        );
    }

    let session = match &args.friend {
        Some(friend_id) => Some(client.open_conversation(friend_id).await?),
        None => None,
    };

    if let (Some(session), Some(text)) = (&session, &args.send) {
        match session.send(text, None).await {
            Ok(row) => info!("[CLI] 📤 已发送: {}", row.id),
            Err(e) => warn!("[CLI] ⚠️ 发送失败: {:#}", e),
        }
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    if let Some(session) = session {
        session.close();
    }
    info!("[CLI] 👋 程序退出");
    Ok(())
}
