//! MCP server container lifecycle and client connections.
//!
//! Each MCP server is a Docker container (started via `bollard`, the
//! same Docker API client used by the container runner) speaking SSE
//! with an `rmcp` client on top. Tool discovery and calls are cached the
//! same way as the upstream MCP client connection: a flag flips when the
//! server announces `tool_list_changed`, and the next `list_tools()`
//! call refreshes the cache lazily rather than on every call.

use crate::db::models::{McpServerRow, McpTransport};
use crate::error::{McpError, Result};
use bollard::Docker;
use bollard::container::{Config as ContainerCfg, RemoveContainerOptions, StopContainerOptions};
use bollard::models::HostConfig;
use rmcp::ClientHandler;
use rmcp::service::{NotificationContext, RoleClient, RunningService};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

type McpClientSession = RunningService<RoleClient, McpClientHandler>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpConnectionState {
    Connecting,
    Connected,
    Failed(String),
    Disconnected,
}

#[derive(Clone)]
struct McpClientHandler {
    tool_list_changed: Arc<AtomicBool>,
    client_info: rmcp::model::ClientInfo,
}

impl McpClientHandler {
    fn new(tool_list_changed: Arc<AtomicBool>) -> Self {
        Self {
            tool_list_changed,
            client_info: rmcp::model::ClientInfo {
                meta: None,
                protocol_version: rmcp::model::ProtocolVersion::default(),
                capabilities: rmcp::model::ClientCapabilities::default(),
                client_info: rmcp::model::Implementation {
                    name: "loop-gateway".to_string(),
                    title: None,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    description: Some("Loop Gateway MCP client".to_string()),
                    icons: None,
                    website_url: None,
                },
            },
        }
    }
}

impl ClientHandler for McpClientHandler {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        self.tool_list_changed.store(true, Ordering::SeqCst);
        std::future::ready(())
    }

    fn get_info(&self) -> rmcp::model::ClientInfo {
        self.client_info.clone()
    }
}

/// One MCP server's container + client connection.
pub struct McpConnection {
    name: String,
    row: McpServerRow,
    docker: Docker,
    container_name: String,
    state: RwLock<McpConnectionState>,
    client: Mutex<Option<McpClientSession>>,
    tools: RwLock<Vec<rmcp::model::Tool>>,
    tool_list_changed: Arc<AtomicBool>,
}

impl McpConnection {
    pub fn new(row: McpServerRow, docker: Docker) -> Self {
        let container_name = format!("loop-gateway-mcp-{}", row.name);
        Self {
            name: row.name.clone(),
            row,
            docker,
            container_name,
            state: RwLock::new(McpConnectionState::Disconnected),
            client: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            tool_list_changed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> McpConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.state().await, McpConnectionState::Connected)
    }

    /// Start the server's container (if it isn't already running) and
    /// initialize the rmcp client session against it.
    pub async fn connect(&self) -> Result<()> {
        *self.state.write().await = McpConnectionState::Connecting;

        match self.start_container_and_session().await {
            Ok((session, tools)) => {
                *self.client.lock().await = Some(session);
                *self.tools.write().await = tools;
                self.tool_list_changed.store(false, Ordering::SeqCst);
                *self.state.write().await = McpConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.client.lock().await = None;
                self.tools.write().await.clear();
                *self.state.write().await = McpConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_container_and_session(&self) -> Result<(McpClientSession, Vec<rmcp::model::Tool>)> {
        if !matches!(self.row.transport, McpTransport::Sse) {
            return Err(McpError::ConnectFailed {
                name: self.name.clone(),
                reason: "only the sse transport is wired for containerized MCP servers".into(),
            }
            .into());
        }

        let env: Vec<String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("MCP_PASSTHROUGH_"))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            auto_remove: Some(true),
            network_mode: Some("bridge".to_string()),
            ..Default::default()
        };
        let config = ContainerCfg {
            image: Some(self.row.image.clone()),
            cmd: self.row.command.clone().map(|c| vec![c]),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: self.container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| McpError::ContainerStart(e.to_string()))?;

        self.docker
            .start_container::<String>(&self.container_name, None)
            .await
            .map_err(|e| McpError::ContainerStart(e.to_string()))?;

        let handler = McpClientHandler::new(self.tool_list_changed.clone());
        let port = self.row.host_port.unwrap_or(0);
        let url = format!("http://127.0.0.1:{port}/sse");
        let transport = rmcp::transport::StreamableHttpClientTransport::from_uri(url);
        let session = rmcp::serve_client(handler, transport)
            .await
            .map_err(|e| McpError::ConnectFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let tools = session
            .list_all_tools()
            .await
            .map_err(|e| McpError::ConnectFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        Ok((session, tools))
    }

    pub async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.cancel().await;
        }
        self.tools.write().await.clear();
        *self.state.write().await = McpConnectionState::Disconnected;

        let _ = self
            .docker
            .stop_container(&self.container_name, Some(StopContainerOptions { t: 5 }))
            .await;
        let _ = self
            .docker
            .remove_container(
                &self.container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    pub async fn list_tools(&self) -> Vec<rmcp::model::Tool> {
        if self.tool_list_changed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.refresh_tools().await {
                tracing::warn!(server = %self.name, error = %e, "failed to refresh mcp tool list");
            }
        }
        self.tools.read().await.clone()
    }

    async fn refresh_tools(&self) -> Result<()> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(McpError::NotFound {
                name: self.name.clone(),
            }
            .into());
        };
        let tools = client
            .list_all_tools()
            .await
            .map_err(|e| McpError::ConnectFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        drop(guard);
        *self.tools.write().await = tools;
        Ok(())
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<rmcp::model::CallToolResult> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => {
                return Err(McpError::ToolCallFailed("tool arguments must be a JSON object".into()).into());
            }
        };

        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(McpError::NotFound {
                name: self.name.clone(),
            }
            .into());
        };

        let params = rmcp::model::CallToolRequestParams {
            meta: None,
            name: std::borrow::Cow::Owned(tool_name.to_string()),
            arguments,
            task: None,
        };

        client
            .call_tool(params)
            .await
            .map_err(|e| McpError::ToolCallFailed(e.to_string()).into())
    }
}

/// Registry of all configured MCP connections, keyed by server name.
pub struct McpManager {
    docker: Docker,
    connections: RwLock<HashMap<String, Arc<McpConnection>>>,
}

impl McpManager {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| McpError::ContainerStart(e.to_string()))?;
        Ok(Self {
            docker,
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, row: McpServerRow) -> Arc<McpConnection> {
        let conn = Arc::new(McpConnection::new(row.clone(), self.docker.clone()));
        self.connections.write().await.insert(row.name.clone(), conn.clone());
        conn
    }

    pub async fn get(&self, name: &str) -> Option<Arc<McpConnection>> {
        self.connections.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<McpConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// All tools across every connected server, namespaced for the tool
    /// registry by the caller.
    pub async fn all_tools(&self) -> Vec<(String, rmcp::model::Tool)> {
        let mut out = Vec::new();
        for conn in self.list().await {
            if !conn.is_connected().await {
                continue;
            }
            for tool in conn.list_tools().await {
                out.push((conn.name().to_string(), tool));
            }
        }
        out
    }

    /// Reconnect health sweep: for each server that dropped out, attempt a
    /// single reconnect; leave it in `Failed` state if that also fails.
    pub async fn health_sweep(&self) {
        for conn in self.list().await {
            if matches!(conn.state().await, McpConnectionState::Failed(_)) {
                if let Err(e) = conn.connect().await {
                    tracing::warn!(server = %conn.name(), error = %e, "mcp reconnect failed");
                }
            }
        }
    }
}
