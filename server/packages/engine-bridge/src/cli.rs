use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use stdio_bridge::admission::{DEFAULT_MAX_IN_FLIGHT, ENV_MAX_IN_FLIGHT};
use stdio_bridge::config::usize_from_env;
use stdio_bridge::mock::MockOptions;
use stdio_bridge::{BridgeConfig, Gateway, LaunchError, LaunchSpec, ProcessBridge};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router_with_state, shutdown_bridge, AppState, AuthConfig};

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;
const ENV_TOKEN: &str = "ENGINE_BRIDGE_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "engine-bridge", bin_name = "engine-bridge")]
#[command(about = "Serve a stdio JSON-RPC engine to concurrent HTTP clients", version)]
#[command(arg_required_else_help = true)]
pub struct EngineBridgeCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server in front of an engine process.
    Server(ServerArgs),
    /// Send one JSON-RPC message to a running server and print the answer.
    Rpc(RpcArgs),
    /// Print bridge status from a running server.
    Status(ClientArgs),
    /// Run the built-in mock engine on stdin/stdout.
    #[command(name = "mock-engine", hide = true)]
    MockEngine(MockEngineArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    #[command(flatten)]
    engine: EngineArgs,

    /// Per-request deadline; falls back to ENGINE_BRIDGE_REQUEST_TIMEOUT_MS.
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Concurrent request ceiling; falls back to ENGINE_BRIDGE_MAX_IN_FLIGHT.
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Per-subscriber notification queue depth.
    #[arg(long)]
    notification_buffer: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Program to spawn as the engine.
    #[arg(long = "engine-command", short = 'c')]
    command: Option<String>,

    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// KEY=VALUE added to the engine environment.
    #[arg(long = "engine-env")]
    env: Vec<String>,

    #[arg(long = "engine-cwd")]
    cwd: Option<PathBuf>,

    /// Launch description as JSON, instead of --engine-command.
    #[arg(long = "launch-json", conflicts_with = "command")]
    launch_json: Option<String>,
}

impl EngineArgs {
    fn launch_spec(&self) -> Result<LaunchSpec, CliError> {
        let launch = match (&self.launch_json, &self.command) {
            (Some(blob), _) => LaunchSpec::from_json(blob)?.args(self.args.iter().cloned()),
            (None, Some(command)) => LaunchSpec::new(command).args(self.args.iter().cloned()),
            (None, None) => return Err(CliError::MissingEngine),
        };
        let mut launch = launch.with_env_pairs(&self.env)?;
        if let Some(cwd) = &self.cwd {
            launch = launch.cwd(cwd);
        }
        Ok(launch)
    }
}

#[derive(Args, Debug)]
pub struct RpcArgs {
    method: String,

    /// JSON params for the call.
    #[arg(long, short = 'p')]
    params: Option<String>,

    /// Send as a notification; no response is awaited.
    #[arg(long)]
    notify: bool,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct MockEngineArgs {
    #[arg(long)]
    fail_initialize: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("no engine configured; pass --engine-command or --launch-json")]
    MissingEngine,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(StatusCode),
}

pub struct CliConfig {
    pub token: Option<String>,
    pub no_token: bool,
}

impl CliConfig {
    /// `--no-token` wins over `--token`, which wins over ENGINE_BRIDGE_TOKEN.
    fn resolved_token(&self) -> Option<String> {
        if self.no_token {
            return None;
        }
        self.token.clone().or_else(|| {
            std::env::var(ENV_TOKEN)
                .ok()
                .filter(|token| !token.trim().is_empty())
        })
    }
}

pub fn run_engine_bridge() -> Result<(), CliError> {
    let EngineBridgeCli {
        command,
        token,
        no_token,
    } = EngineBridgeCli::parse();
    let config = CliConfig { token, no_token };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Rpc(args) => run_rpc(cli, args),
        Command::Status(args) => run_status(cli, args),
        Command::MockEngine(args) => run_mock_engine(args),
    }
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let auth = match cli.resolved_token() {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };

    let mut config = BridgeConfig::from_env(server.engine.launch_spec()?);
    if let Some(timeout_ms) = server.request_timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(buffer) = server.notification_buffer {
        config = config.with_notification_buffer(buffer);
    }
    let max_in_flight = server
        .max_in_flight
        .unwrap_or_else(|| usize_from_env(ENV_MAX_IN_FLIGHT, DEFAULT_MAX_IN_FLIGHT));

    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let engine = config.launch.display();
        let timeout_ms = config.request_timeout.as_millis() as u64;
        let gateway = Gateway::new(ProcessBridge::new(config), max_in_flight);
        let state = Arc::new(AppState::new(auth, gateway));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            engine = %engine,
            max_in_flight = max_in_flight,
            request_timeout_ms = timeout_ms,
            "server listening"
        );
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                shutdown_bridge(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_rpc(cli: &CliConfig, args: &RpcArgs) -> Result<(), CliError> {
    let ctx = ClientContext::new(cli, &args.client)?;
    let params = match &args.params {
        Some(raw) => serde_json::from_str::<Value>(raw)?,
        None => Value::Null,
    };
    let mut message = json!({"jsonrpc": "2.0", "method": args.method});
    if !params.is_null() {
        message["params"] = params;
    }
    if !args.notify {
        message["id"] = json!(1);
    }

    let response = ctx.post(&format!("{API_PREFIX}/rpc"), &message)?;
    if response.status() == StatusCode::ACCEPTED {
        return Ok(());
    }
    print_json_response(response)
}

fn run_status(cli: &CliConfig, args: &ClientArgs) -> Result<(), CliError> {
    let ctx = ClientContext::new(cli, args)?;
    let response = ctx.get(&format!("{API_PREFIX}/status"))?;
    print_json_response(response)
}

fn run_mock_engine(args: &MockEngineArgs) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;
    runtime.block_on(stdio_bridge::mock::run(MockOptions {
        fail_initialize: args.fail_initialize,
    }))?;
    Ok(())
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No origins configured: cross-origin requests are refused.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    token: Option<String>,
    client: HttpClient,
}

impl ClientContext {
    fn new(cli: &CliConfig, args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self {
            endpoint,
            token: cli.resolved_token(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path).send()?)
    }

    fn post(&self, path: &str, body: &Value) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }
}

fn print_json_response(response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: Value = serde_json::from_str(&text)?;
    write_stdout_line(&serde_json::to_string_pretty(&parsed)?)
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        write_stderr_line(&serde_json::to_string_pretty(&json)?)
    } else {
        write_stderr_line(text)
    }
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
