use std::path::PathBuf;

use clap::{Args, Subcommand};
use netdash_core::config::AppConfig;
use netdash_core::error::ToolError;
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub mod bounding;
pub mod catalog;
pub mod dispatcher;
pub mod engine;
pub mod policy;
pub mod registry;
pub mod schema;

use engine::{EngineContext, ToolExecutionEngine};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "netdash-mcp";
/// Largest request body accepted on stdin.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the netdash MCP server over stdio
    Serve(McpServeArgs),
    /// Print the tool catalog with schemas and approval annotations
    Tools(McpToolsArgs),
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// Disable auth header injection (useful behind auth proxies)
    #[arg(long)]
    pub no_auth: bool,
    /// Dashboard API key sent as a bearer token
    #[arg(long, env = "NETDASH_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct McpToolsArgs {
    /// Only list tools that would run without confirmation
    #[arg(long)]
    pub auto_approved_only: bool,
}

/// Settings shared by every subcommand, resolved by the binary.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub api_url: Option<String>,
    pub config_path: Option<PathBuf>,
}

pub async fn run(options: RuntimeOptions, command: McpCommands) -> i32 {
    let config = match load_config(&options) {
        Ok(config) => config,
        Err(message) => return exit_with_error("config_error", &message),
    };

    match command {
        McpCommands::Serve(args) => {
            let token = if args.no_auth { None } else { args.api_key };
            if token.is_none() {
                tracing::warn!("no API key configured, requests will be sent unauthenticated");
            }
            let engine = match build_engine(&config, token) {
                Ok(engine) => engine,
                Err(message) => return exit_with_error("config_error", &message),
            };
            let server = McpServer::new(engine);
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(message) => exit_with_error("mcp_server_error", &message),
            }
        }
        McpCommands::Tools(args) => {
            let engine = match build_engine(&config, None) {
                Ok(engine) => engine,
                Err(message) => return exit_with_error("config_error", &message),
            };
            let mut payload = McpServer::new(engine).tools_list_payload();
            if args.auto_approved_only
                && let Some(tools) = payload["tools"].as_array_mut()
            {
                tools.retain(|tool| tool["annotations"]["autoApproved"] == true);
            }
            println!("{}", to_pretty_json(&payload));
            0
        }
    }
}

fn load_config(options: &RuntimeOptions) -> Result<AppConfig, String> {
    let mut config = AppConfig::load(options.config_path.as_deref()).map_err(|e| e.to_string())?;
    if let Some(api_url) = &options.api_url {
        config.api.base_url = api_url.clone();
    }
    Ok(config)
}

fn build_engine(config: &AppConfig, token: Option<String>) -> Result<ToolExecutionEngine, String> {
    let registry = catalog::builtin_registry().map_err(|e| e.to_string())?;
    let ctx = EngineContext::from_config(config, registry, token).map_err(|e| e.to_string())?;
    Ok(ToolExecutionEngine::new(ctx))
}

fn exit_with_error(kind: &str, message: &str) -> i32 {
    tracing::error!(kind, message, "netdash-mcp exiting");
    let payload = json!({
        "error": kind,
        "message": message,
    });
    eprintln!("{}", to_pretty_json(&payload));
    1
}

pub struct McpServer {
    engine: ToolExecutionEngine,
}

impl McpServer {
    pub fn new(engine: ToolExecutionEngine) -> Self {
        Self { engine }
    }

    async fn serve_stdio(&self) -> Result<(), String> {
        let mut reader = BufReader::new(io::stdin());
        let mut stdout = io::stdout();
        self.serve(&mut reader, &mut stdout).await
    }

    pub async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!(
            server = MCP_SERVER_NAME,
            version = env!("CARGO_PKG_VERSION"),
            tools = self.engine.context().registry.len(),
            "mcp server ready"
        );

        loop {
            let incoming = read_framed_json(reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(writer, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        tracing::info!("mcp client closed the stream");
        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Responses to server-initiated requests; this server never sends any.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        let Some(id) = obj.get("id").cloned() else {
            tracing::debug!(method, "ignoring notification");
            return None;
        };
        Some(match self.handle_request(method, params).await {
            Ok(payload) => success_response(id, payload),
            Err(err) => error_response(id, err),
        })
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Each tool maps to one dashboard API operation. Large lists come back \
                summarized (totalCount, firstItems, facetSummaries) or truncated \
                (items, totalCount, returnedCount); narrow the query to see more."
        })
    }

    fn tools_list_payload(&self) -> Value {
        let ctx = self.engine.context();
        let tools: Vec<Value> = ctx
            .registry
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.schema.to_json_schema(),
                    "annotations": {
                        "readOnlyHint": tool.is_read_only(),
                        "autoApproved": ctx.policy.is_auto_approved(&tool.name)
                    }
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        Ok(match self.engine.invoke(name, args).await {
            Ok(envelope) => build_tool_call_response(envelope.into_value(), false),
            Err(err) => {
                log_tool_failure(name, &err);
                build_tool_call_response(err.to_value(), true)
            }
        })
    }
}

fn log_tool_failure(name: &str, err: &ToolError) {
    match err {
        ToolError::Validation { .. } | ToolError::UnknownTool { .. } => {
            tracing::info!(tool = name, kind = err.kind(), "tool call rejected");
        }
        ToolError::UpstreamApi { .. } | ToolError::Transport { .. } => {
            tracing::warn!(tool = name, kind = err.kind(), error = %err, "tool call failed");
        }
    }
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    })
}

async fn read_framed_json<R>(reader: &mut R) -> Result<Option<Value>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" || line == "\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    if content_length > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Content-Length {content_length} exceeds the {MAX_FRAME_BYTES} byte limit"),
        ));
    }
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json<W>(writer: &mut W, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
