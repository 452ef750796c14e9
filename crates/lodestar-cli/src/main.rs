//! # Lodestar CLI
//!
//! Serves a test object over TCP and invokes operations through the retrying
//! invocation engine.
//!
//! ## Usage
//!
//! ```bash
//! # Serve an echo object
//! lodestar serve --listen 127.0.0.1:10000
//!
//! # Call it (outputs the reply payload as raw JSON)
//! lodestar call -e tcp://127.0.0.1:10000 -o greet -p '{"name": "ada"}' --idempotent
//!
//! # Several endpoints are tried round-robin across retries
//! lodestar call -e tcp://10.0.0.1:10000 -e tcp://10.0.0.2:10000 -o greet --retries 4
//! ```
//!
//! Log output goes to stderr; `RUST_LOG=lodestar::retry=debug` shows every
//! retry decision.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use lodestar_client::Communicator;
use lodestar_common::transport::FrameServer;
use lodestar_common::{Endpoint, InvocationConfig, InvocationMode, Reference, ReplyStatus, RequestFrame, ResponseFrame};
use lodestar_metrics::MetricsObserver;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(FromArgs)]
/// Lodestar - location-transparent RPC invocations
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for serving an echo object.
///
/// Every operation replies with the request's identity, operation and payload.
/// The `fail` operation replies with a user exception, `missing` with
/// object-not-exist.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve an echo object over TCP
struct ServeArgs {
    /// address to listen on
    #[argh(option, short = 'l', default = "\"127.0.0.1:10000\".into()")]
    listen: String,
}

/// Arguments for a single invocation.
///
/// Prints the reply payload as raw JSON on stdout. Failure replies and local
/// failures go to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// invoke an operation on a remote object
struct CallArgs {
    /// endpoint of the target object, e.g. tcp://127.0.0.1:10000
    ///
    /// May be repeated; endpoints are tried round-robin across attempts.
    #[argh(option, short = 'e', long = "endpoint")]
    endpoints: Vec<String>,

    /// identity of the target object
    #[argh(option, short = 'i', default = "\"echo\".into()")]
    identity: String,

    /// operation to invoke
    #[argh(option, short = 'o')]
    operation: String,

    /// JSON payload of the request
    #[argh(option, short = 'p', default = "\"null\".into()")]
    payload: String,

    /// the operation may safely run more than once
    #[argh(switch)]
    idempotent: bool,

    /// send without waiting for a reply
    #[argh(switch)]
    oneway: bool,

    /// maximum number of attempts, first one included
    #[argh(option, long = "retries")]
    retries: Option<u32>,

    /// timeout of each attempt in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// print invocation metrics to stderr when done
    #[argh(switch)]
    metrics: bool,
}

impl CallArgs {
    fn config(&self) -> InvocationConfig {
        let mut config = InvocationConfig::default();
        if let Some(retries) = self.retries {
            config = config.with_retry_max_attempts(retries);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config = config.with_invocation_timeout(Duration::from_millis(timeout_ms));
        }
        config
    }

    fn reference(&self) -> Result<Reference> {
        if self.endpoints.is_empty() {
            return Err(anyhow!("at least one --endpoint is required"));
        }
        let endpoints = self
            .endpoints
            .iter()
            .map(|e| e.parse::<Endpoint>().with_context(|| format!("invalid endpoint `{}`", e)))
            .collect::<Result<Vec<_>>>()?;
        let mode = if self.oneway {
            InvocationMode::Oneway
        } else {
            InvocationMode::Twoway
        };
        Ok(Reference::direct(self.identity.as_str(), endpoints).with_mode(mode))
    }
}

async fn echo(request: RequestFrame) -> lodestar_common::Result<ResponseFrame> {
    let reply = json!({
        "identity": request.identity.to_string(),
        "operation": request.operation,
        "payload": request.payload,
    });
    Ok(match request.operation.as_str() {
        "fail" => ResponseFrame::failure(request.id, ReplyStatus::UserException, reply),
        "missing" => ResponseFrame::failure(request.id, ReplyStatus::ObjectNotExist, Value::Null),
        _ => ResponseFrame::success(request.id, reply),
    })
}

async fn serve(args: ServeArgs) -> Result<()> {
    let server = FrameServer::bind(&args.listen).await?;
    tracing::info!("Serving echo object on {}", server.local_addr()?);
    tokio::select! {
        result = server.run_with_handler(echo) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let payload: Value = serde_json::from_str(&args.payload).context("payload is not valid JSON")?;
    let metrics = Arc::new(MetricsObserver::new());
    let communicator = Communicator::builder()
        .config(args.config())
        .observer(metrics.clone())
        .build();
    let proxy = communicator.proxy(args.reference()?);

    let mut request = proxy.request(args.operation.as_str(), payload);
    if args.idempotent {
        request = request.idempotent();
    }
    let result = proxy.invoke(request, &CancellationToken::new()).await;
    communicator.shutdown();

    if args.metrics {
        eprintln!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }

    match result? {
        Some(response) if response.is_success() => {
            println!("{}", serde_json::to_string(&response.payload)?);
            Ok(())
        }
        Some(response) => Err(anyhow!(
            "remote failure {:?}: {}",
            response.status,
            response.payload
        )),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Call(args) => call(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_default() {
        let args: Cli = <Cli as argh::FromArgs>::from_args(&["lodestar"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { listen }) => assert_eq!(listen, "127.0.0.1:10000"),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = <Cli as argh::FromArgs>::from_args(
            &["lodestar"],
            &[
                "call",
                "-e",
                "tcp://10.0.0.1:10000",
                "-e",
                "tcp -h 10.0.0.2 -p 10000",
                "-o",
                "greet",
                "--idempotent",
                "--retries",
                "3",
            ],
        )
        .unwrap();
        let Commands::Call(call) = args.command else {
            panic!("Expected Call command");
        };
        assert_eq!(call.operation, "greet");
        assert!(call.idempotent);
        assert!(!call.oneway);
        assert_eq!(call.config().retry_max_attempts, 3);

        let reference = call.reference().unwrap();
        assert_eq!(reference.endpoints().len(), 2);
        assert_eq!(reference.identity().to_string(), "echo");
        assert_eq!(reference.mode(), InvocationMode::Twoway);
    }

    #[test]
    fn test_call_without_endpoint_is_rejected() {
        let args: Cli = <Cli as argh::FromArgs>::from_args(&["lodestar"], &["call", "-o", "greet", "--oneway"]).unwrap();
        let Commands::Call(call) = args.command else {
            panic!("Expected Call command");
        };
        assert!(call.reference().is_err());
    }

    #[tokio::test]
    async fn test_echo_handler_statuses() {
        let reply = echo(RequestFrame::new("echo", "greet", json!(1))).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.payload["operation"], "greet");

        let failed = echo(RequestFrame::new("echo", "fail", Value::Null)).await.unwrap();
        assert_eq!(failed.status, ReplyStatus::UserException);
    }
}
