//! Loop Gateway entry point: load configuration, wire every subsystem into
//! one `AppContext`, start the channel adapters and the webhook HTTP
//! server, then idle until a shutdown signal arrives.

use anyhow::Context as _;
use loop_gateway::config::RuntimeConfig;
use loop_gateway::container_runner::ContainerRunner;
use loop_gateway::conversation::ConversationRouter;
use loop_gateway::db::models::RiskLevel;
use loop_gateway::db::Db;
use loop_gateway::event_bus::EventBus;
use loop_gateway::hitl::ApprovalManager;
use loop_gateway::llm::LlmManager;
use loop_gateway::mcp::McpManager;
use loop_gateway::messaging::manager::MessagingManager;
use loop_gateway::messaging::{discord, email, mattermost, slack, telegram, webchat, webhook, whatsapp};
use loop_gateway::resilience::Resilience;
use loop_gateway::tools::catalog::{SkillCatalog, SuggestSkillTool, SUGGEST_SKILL_RISK};
use loop_gateway::tools::run_script::RunScriptTool;
use loop_gateway::tools::{mcp_bridge::McpToolAdapter, skill_loader, ToolRegistry};
use loop_gateway::{api, AppContext, ChannelId, ChannelType};
use rig::tool::Tool as _;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Sweep period for HITL timeout cleanup, MCP reconnects, and skill
/// directory rescans.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime_config = RuntimeConfig::from_env().context("failed to load configuration")?;
    let _log_guard = init_logging(&runtime_config)?;

    let db = Db::connect(&runtime_config.static_config.db_path)
        .await
        .context("failed to open database")?;
    let event_bus = EventBus::new();

    let api_key = runtime_config
        .static_config
        .anthropic_api_key
        .clone()
        .context("ANTHROPIC_API_KEY missing (Config::load should have rejected this earlier)")?;
    let llm = Arc::new(LlmManager::new(api_key).context("failed to build the LLM client")?);

    let resilience = Arc::new(Resilience::new(*runtime_config.resilience.load_full()));
    let container_runner = Arc::new(
        ContainerRunner::new(runtime_config.container.load_full().as_ref().clone())
            .context("failed to connect to the Docker daemon for the sandbox runner")?,
    );
    let mcp_manager = Arc::new(McpManager::new().context("failed to connect to the Docker daemon for MCP servers")?);

    let skill_catalog = Arc::new(SkillCatalog::new());
    let tool_registry = Arc::new(ToolRegistry::new());
    tool_registry.register_builtin(RunScriptTool, RiskLevel::High);
    tool_registry.register_builtin(SuggestSkillTool::new(skill_catalog.clone()), SUGGEST_SKILL_RISK);

    load_skills(&db, &tool_registry, &skill_catalog, &container_runner, &runtime_config).await?;

    let hitl = Arc::new(ApprovalManager::new(
        db.clone(),
        event_bus.clone(),
        runtime_config.hitl_defaults,
    ));

    let config = Arc::new(runtime_config);
    let ctx = AppContext {
        db: db.clone(),
        config: config.clone(),
        event_bus: event_bus.clone(),
        tool_registry: tool_registry.clone(),
        skill_catalog: skill_catalog.clone(),
        hitl: hitl.clone(),
        container_runner: container_runner.clone(),
        mcp_manager: mcp_manager.clone(),
        llm: llm.clone(),
        resilience: resilience.clone(),
    };

    connect_mcp_servers(&ctx).await?;

    let router = Arc::new(ConversationRouter::new(ctx.clone()));

    let (messaging_manager, channel_id_by_type) = build_messaging_manager(&ctx, router.clone()).await?;
    let messaging_manager = Arc::new(messaging_manager);
    router.bind_manager(messaging_manager.clone());
    hitl.bind_manager(messaging_manager.clone());
    messaging_manager.clone().start_all(channel_id_by_type).await?;

    let api_state = api::ApiState::new(ctx.clone(), router.clone());
    let bind: SocketAddr = format!("{}:{}", ctx.config.static_config.host, ctx.config.static_config.port)
        .parse()
        .context("HOST/PORT did not form a valid socket address")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let http_handle = api::start_http_server(bind, api_state, shutdown_rx.clone())
        .await
        .context("failed to start the HTTP server")?;

    let sweeper = spawn_sweeper(ctx.clone(), shutdown_rx.clone());

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received, winding down");
    let _ = shutdown_tx.send(true);
    let _ = http_handle.await;
    let _ = sweeper.await;

    Ok(())
}

/// `EnvFilter` + `fmt` layer to stdout, plus a daily-rolling file sink
/// under `DATA_DIR/logs`. The returned guard must stay alive for the life
/// of the process or the non-blocking file writer stops flushing.
fn init_logging(config: &RuntimeConfig) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let log_dir = config.static_config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "loop-gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

/// Discover skills on disk, register each as a dynamic tool, and keep the
/// `skills_registry` table and in-memory catalog in sync with the
/// enable state already recorded there.
async fn load_skills(
    db: &Db,
    tool_registry: &Arc<ToolRegistry>,
    skill_catalog: &Arc<SkillCatalog>,
    container_runner: &Arc<ContainerRunner>,
    runtime_config: &RuntimeConfig,
) -> anyhow::Result<()> {
    let skills_dir = runtime_config.static_config.skills_dir();
    let discovered = skill_loader::discover(&skills_dir).context("failed to scan skills directory")?;

    for (manifest, directory) in &discovered {
        db.skills()
            .upsert(&manifest.name, "user", directory.to_str(), None)
            .await
            .context("failed to upsert skill registry row")?;
    }

    let rows = db.skills().list().await.context("failed to list skill registry rows")?;
    let enabled_by_name: HashMap<String, bool> = rows.into_iter().map(|r| (r.name, r.enabled)).collect();

    let mut catalog_entries = Vec::new();
    let default_sandbox_image = runtime_config.container.load().image.clone();

    for (manifest, directory) in discovered {
        let risk = skill_loader::risk_level_of(&manifest);
        let enabled = enabled_by_name.get(&manifest.name).copied().unwrap_or(true);

        let mut tool = skill_loader::SkillTool::new(manifest.clone(), directory);
        if manifest.sandbox {
            tool = tool.with_container_runner(container_runner.clone(), default_sandbox_image.clone());
        }

        if let Err(error) = tool_registry.register_dynamic(tool, risk) {
            tracing::warn!(skill = %manifest.name, %error, "failed to register skill");
            continue;
        }
        let _ = tool_registry.set_enabled(&manifest.name, enabled);

        if !enabled {
            catalog_entries.push(loop_gateway::tools::catalog::CatalogEntry {
                name: manifest.name,
                description: manifest.description,
            });
        }
    }
    skill_catalog.set(catalog_entries);

    Ok(())
}

/// Register every MCP server already present in the database and connect
/// it, bridging its tools into the registry once the connection succeeds.
/// A server that fails to connect is left for `health_sweep` to retry.
async fn connect_mcp_servers(ctx: &AppContext) -> anyhow::Result<()> {
    let rows = ctx.db.mcp_servers().list().await.context("failed to list MCP servers")?;
    for row in rows {
        let ctx = ctx.clone();
        let server_name = row.name.clone();
        let server_id = row.id;
        let connection = ctx.mcp_manager.register(row).await;
        tokio::spawn(async move {
            if let Err(error) = connection.connect().await {
                tracing::warn!(server = %server_name, %error, "mcp server failed to connect at startup");
                return;
            }
            let tools = connection.list_tools().await;
            let mut names = Vec::with_capacity(tools.len());
            for tool in tools {
                let adapter = McpToolAdapter::new(server_name.clone(), tool, connection.clone());
                let name = adapter.name();
                if let Err(error) = ctx.tool_registry.register_dynamic(adapter, RiskLevel::Medium) {
                    tracing::warn!(server = %server_name, tool = %name, %error, "failed to bridge mcp tool");
                    continue;
                }
                names.push(name);
            }
            if let Err(error) = ctx.db.mcp_servers().cache_tools(server_id, &names).await {
                tracing::warn!(server = %server_name, %error, "failed to cache mcp tool names");
            }
        });
    }
    Ok(())
}

/// Build the `MessagingManager` with one adapter per enabled channel row,
/// parsing each row's `config` JSON for adapter-specific fields. A channel
/// missing required fields is skipped with a logged warning rather than
/// aborting startup.
async fn build_messaging_manager(
    ctx: &AppContext,
    router: Arc<ConversationRouter>,
) -> anyhow::Result<(MessagingManager, HashMap<String, ChannelId>)> {
    let mut manager = MessagingManager::new(ctx.clone(), router);
    let mut channel_id_by_type = HashMap::new();

    let rows = ctx.db.channels().list_enabled().await.context("failed to list enabled channels")?;
    for row in rows {
        let key = row.channel_type.to_string();
        match row.channel_type {
            ChannelType::Telegram => match row.config.get("bot_token").and_then(|v| v.as_str()) {
                Some(token) => manager.register(telegram::TelegramAdapter::new(token, ctx.clone())),
                None => {
                    tracing::warn!(channel = %row.display_name, "telegram channel missing bot_token, skipping");
                    continue;
                }
            },
            ChannelType::Discord => match row.config.get("bot_token").and_then(|v| v.as_str()) {
                Some(token) => manager.register(discord::DiscordAdapter::new(token, ctx.clone())),
                None => {
                    tracing::warn!(channel = %row.display_name, "discord channel missing bot_token, skipping");
                    continue;
                }
            },
            ChannelType::Slack => {
                let bot_token = row.config.get("bot_token").and_then(|v| v.as_str());
                let app_token = row.config.get("app_token").and_then(|v| v.as_str());
                match (bot_token, app_token) {
                    (Some(bot), Some(app)) => match slack::SlackAdapter::new(bot, app, ctx.clone()) {
                        Ok(adapter) => manager.register(adapter),
                        Err(error) => {
                            tracing::warn!(channel = %row.display_name, %error, "failed to build slack adapter");
                            continue;
                        }
                    },
                    _ => {
                        tracing::warn!(channel = %row.display_name, "slack channel missing bot_token/app_token, skipping");
                        continue;
                    }
                }
            }
            ChannelType::Whatsapp => {
                let phone_number_id = row.config.get("phone_number_id").and_then(|v| v.as_str());
                let access_token = row.config.get("access_token").and_then(|v| v.as_str());
                match (phone_number_id, access_token) {
                    (Some(phone), Some(token)) => {
                        manager.register(whatsapp::WhatsAppAdapter::new(phone, token, ctx.clone()))
                    }
                    _ => {
                        tracing::warn!(channel = %row.display_name, "whatsapp channel missing phone_number_id/access_token, skipping");
                        continue;
                    }
                }
            }
            ChannelType::Email => {
                match serde_json::from_value::<email::EmailConfig>(row.config.clone()) {
                    Ok(email_config) => match email::EmailAdapter::new(email_config, ctx.clone()) {
                        Ok(adapter) => manager.register(adapter),
                        Err(error) => {
                            tracing::warn!(channel = %row.display_name, %error, "failed to build email adapter");
                            continue;
                        }
                    },
                    Err(error) => {
                        tracing::warn!(channel = %row.display_name, %error, "email channel config invalid, skipping");
                        continue;
                    }
                }
            }
            ChannelType::Mattermost => manager.register(mattermost::MattermostAdapter::new(ctx.clone())),
            ChannelType::Webhook => manager.register(webhook::WebhookAdapter::new(ctx.clone())),
            ChannelType::WebWidget => manager.register(webchat::WebChatAdapter::new()),
        }
        channel_id_by_type.insert(key, row.id);
    }

    Ok((manager, channel_id_by_type))
}

/// One background task covering every periodic concern: HITL timeout
/// sweeping (catches rows whose in-process waiter didn't survive a
/// restart), MCP reconnect attempts, and a skills-directory rescan for
/// manifests added after startup.
fn spawn_sweeper(ctx: AppContext, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut known_skills: std::collections::HashSet<String> = ctx
            .db
            .skills()
            .list()
            .await
            .map(|rows| rows.into_iter().map(|r| r.name).collect())
            .unwrap_or_default();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(error) = ctx.hitl.sweep_expired().await {
                tracing::warn!(%error, "hitl sweep failed");
            }
            ctx.mcp_manager.health_sweep().await;

            let skills_dir = ctx.config.static_config.skills_dir();
            match skill_loader::discover(&skills_dir) {
                Ok(discovered) => {
                    for (manifest, directory) in discovered {
                        if known_skills.contains(&manifest.name) {
                            continue;
                        }
                        known_skills.insert(manifest.name.clone());
                        tracing::info!(skill = %manifest.name, "new skill manifest discovered");
                        if let Err(error) = ctx
                            .db
                            .skills()
                            .upsert(&manifest.name, "user", directory.to_str(), None)
                            .await
                        {
                            tracing::warn!(skill = %manifest.name, %error, "failed to register newly discovered skill");
                            continue;
                        }
                        let _ = ctx.db.skills().set_enabled(&manifest.name, false).await;
                        let risk = skill_loader::risk_level_of(&manifest);
                        let mut tool = skill_loader::SkillTool::new(manifest.clone(), directory);
                        if manifest.sandbox {
                            let default_image = ctx.config.container.load().image.clone();
                            tool = tool.with_container_runner(ctx.container_runner.clone(), default_image);
                        }
                        if let Err(error) = ctx.tool_registry.register_dynamic(tool, risk) {
                            tracing::warn!(skill = %manifest.name, %error, "failed to register newly discovered skill tool");
                            continue;
                        }
                        let _ = ctx.tool_registry.set_enabled(&manifest.name, false);
                        let mut entries = ctx.skill_catalog.entries();
                        entries.push(loop_gateway::tools::catalog::CatalogEntry {
                            name: manifest.name,
                            description: manifest.description,
                        });
                        ctx.skill_catalog.set(entries);
                    }
                }
                Err(error) => tracing::warn!(%error, "skills directory rescan failed"),
            }
        }
    })
}
