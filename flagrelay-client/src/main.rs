use anyhow::Context;
use clap::{Parser, Subcommand};
use flagrelay_core::{Event, FlagOrder, FlagrelayError, HandlerConfig, Outcome};
use flagrelay_runner::RequestHandler;
use reqwest::Client;
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "flagrelay")]
#[command(about = "Run or send flagrelay events", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server URL
    #[arg(long, default_value = "http://localhost:3000")]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health,

    /// Run an event locally and print its outcome
    Invoke {
        /// Request body, e.g. "name=demo&region=eu-west-1"
        #[arg(short, long)]
        body: String,

        #[command(flatten)]
        local: LocalOptions,

        /// Also print the invocation report
        #[arg(long)]
        report: bool,
    },

    /// Print the argument list an event would produce, without running anything
    Args {
        /// Request body
        #[arg(short, long)]
        body: String,

        #[command(flatten)]
        local: LocalOptions,
    },

    /// Send an event to a running server
    Send {
        /// Request body
        #[arg(short, long)]
        body: String,
    },
}

#[derive(clap::Args)]
struct LocalOptions {
    /// Handler config file (TOML); defaults to $FLAGRELAY_CONFIG
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executable to launch instead of the configured one
    #[arg(short, long)]
    executable: Option<PathBuf>,

    /// Emit body flags in body order instead of reversed
    #[arg(long)]
    forward: bool,
}

impl LocalOptions {
    fn handler_config(&self) -> anyhow::Result<HandlerConfig> {
        let mut config = match &self.config {
            Some(path) => HandlerConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?
                .with_overrides(|name| std::env::var(name).ok())?,
            None => HandlerConfig::load()?,
        };
        if let Some(executable) = &self.executable {
            config = config.with_executable(executable);
        }
        if self.forward {
            config = config.with_flag_order(FlagOrder::Forward);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Health => {
            if check_health(&client, &cli.server).await? {
                println!("Server is healthy");
            } else {
                eprintln!("Server is unhealthy");
                process::exit(1);
            }
        }
        Commands::Invoke {
            body,
            local,
            report,
        } => {
            let config = local.handler_config()?;
            info!(
                executable = %config.executable.display(),
                flag_order = ?config.flag_order,
                "Running event locally"
            );
            let handler = RequestHandler::new(config);
            let (tx, rx) = oneshot::channel();
            let invocation = handler.run(&Event::new(body), tx).await;
            debug!(
                invocation_id = %invocation.id,
                resolution = ?invocation.resolution,
                "Local invocation finished"
            );

            let outcome = rx
                .await
                .unwrap_or_else(|_| Outcome::Failure(FlagrelayError::Abandoned));
            if report {
                eprintln!("{}", serde_json::to_string_pretty(&invocation)?);
            }
            match outcome {
                Outcome::Success(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Outcome::Failure(err) => {
                    eprintln!("{}: {}", err.kind(), err);
                    process::exit(1);
                }
            }
        }
        Commands::Args { body, local } => {
            let handler = RequestHandler::new(local.handler_config()?);
            let arguments = handler.prepare(&Event::new(body))?;
            for arg in arguments.iter() {
                println!("{}", arg);
            }
        }
        Commands::Send { body } => {
            let (status, value) = send_body(&client, &cli.server, &body).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            if !status.is_success() {
                process::exit(1);
            }
        }
    }

    Ok(())
}

async fn check_health(client: &Client, server: &str) -> anyhow::Result<bool> {
    let url = format!("{}/health", server);
    debug!(url = %url, "Checking server health");
    let response = client.get(&url).send().await?;
    info!(status = %response.status(), "Health check answered");
    Ok(response.status().is_success())
}

/// POST a raw form body to the server's invoke endpoint.
async fn send_body(
    client: &Client,
    server: &str,
    body: &str,
) -> anyhow::Result<(reqwest::StatusCode, Value)> {
    let url = format!("{}/invoke", server);
    info!(url = %url, body = %body, "Sending event");
    let response = client
        .post(&url)
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(body.to_string())
        .send()
        .await
        .with_context(|| format!("sending event to {}", url))?;

    let status = response.status();
    debug!(status = %status, "Server answered");
    let value = response
        .json::<Value>()
        .await
        .context("server returned a non-JSON response")?;
    Ok((status, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_body_posts_raw_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/invoke")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body("a=1&b=2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let (status, value) = send_body(&Client::new(), &server.url(), "a=1&b=2")
            .await
            .unwrap();

        assert!(status.is_success());
        assert_eq!(value, json!({"ok": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_body_relays_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/invoke")
            .with_status(502)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errorType":"SubprocessExited","errorMessage":"No results"}"#)
            .create_async()
            .await;

        let (status, value) = send_body(&Client::new(), &server.url(), "a=1")
            .await
            .unwrap();

        assert_eq!(status.as_u16(), 502);
        assert_eq!(value["errorMessage"], "No results");
    }

    #[tokio::test]
    async fn test_check_health() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        assert!(check_health(&Client::new(), &server.url()).await.unwrap());
    }

    #[test]
    fn test_local_options_override_config() {
        let options = LocalOptions {
            config: None,
            executable: Some(PathBuf::from("/opt/aqua")),
            forward: true,
        };

        let config = options.handler_config().unwrap();

        assert_eq!(config.executable, PathBuf::from("/opt/aqua"));
        assert_eq!(config.flag_order, FlagOrder::Forward);
    }
}
