// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OrderMirror Control CLI
//!
//! Publishes order documents onto the durable channel and reports how far a
//! durable consumer is behind.
//!
//! Usage:
//!   ordermirror-ctl <command> [options]
//!
//! Commands:
//!   publish <file.json> [--subject <s>]
//!   pending [--subject <s>] [--durable <name>]

use std::process::ExitCode;

use ordermirror_core::channel::{DurableChannel, PgChannel};
use ordermirror_core::config::Config;

fn print_usage() {
    eprintln!(
        r#"Usage: ordermirror-ctl <command> [options]

Publish orders and inspect the durable channel.

COMMANDS:
    publish <file.json>             Publish the file contents as one message
    pending                         Count messages a durable has not acknowledged

PUBLISH OPTIONS:
    --subject <s>                   Subject to publish on (default: $ORDERMIRROR_SUBJECT)

PENDING OPTIONS:
    --subject <s>                   Subject (default: $ORDERMIRROR_SUBJECT)
    --durable <name>                Durable name (default: $ORDERMIRROR_DURABLE_NAME)

ENVIRONMENT:
    ORDERMIRROR_CHANNEL_URL         Channel PostgreSQL URL (default: $ORDERMIRROR_DATABASE_URL)
    ORDERMIRROR_CLUSTER_ID          Cluster (default: test-cluster)

EXAMPLES:
    # Publish a sample order
    ordermirror-ctl publish ./model.json

    # See what the service still has to process
    ordermirror-ctl pending --durable order-durable
"#
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Publish {
        file: String,
        subject: Option<String>,
    },
    Pending {
        subject: Option<String>,
        durable: Option<String>,
    },
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "publish" => {
            let mut file: Option<String> = None;
            let mut subject: Option<String> = None;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--subject" => {
                        i += 1;
                        subject = Some(args.get(i).ok_or("--subject requires a value")?.clone());
                    }
                    arg if arg.starts_with("--") => {
                        return Err(format!("Unknown argument: {}", arg));
                    }
                    arg => {
                        if file.is_some() {
                            return Err(format!("Unexpected argument: {}", arg));
                        }
                        file = Some(arg.to_string());
                    }
                }
                i += 1;
            }

            Ok(Command::Publish {
                file: file.ok_or("publish requires a file")?,
                subject,
            })
        }
        "pending" => {
            let mut subject: Option<String> = None;
            let mut durable: Option<String> = None;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--subject" => {
                        i += 1;
                        subject = Some(args.get(i).ok_or("--subject requires a value")?.clone());
                    }
                    "--durable" => {
                        i += 1;
                        durable = Some(args.get(i).ok_or("--durable requires a name")?.clone());
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::Pending { subject, durable })
        }
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cmd = match parse_args() {
        Ok(Command::Help) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let channel = match PgChannel::connect(&config.channel_url, &config.cluster_id).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to connect to channel: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = execute_command(&channel, &config, cmd).await;
    let _ = channel.close().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute_command(
    channel: &PgChannel,
    config: &Config,
    cmd: Command,
) -> Result<(), String> {
    match cmd {
        Command::Publish { file, subject } => {
            let data = tokio::fs::read(&file)
                .await
                .map_err(|e| format!("Failed to read {}: {}", file, e))?;
            let subject = subject.unwrap_or_else(|| config.subject.clone());

            if serde_json::from_slice::<serde_json::Value>(&data).is_err() {
                eprintln!("Warning: {} is not valid JSON; the service will not ack it", file);
            }

            let sequence = channel
                .publish(&subject, &data)
                .await
                .map_err(|e| e.to_string())?;
            println!(
                "Published {} bytes to '{}' (sequence {})",
                data.len(),
                subject,
                sequence
            );
        }

        Command::Pending { subject, durable } => {
            let subject = subject.unwrap_or_else(|| config.subject.clone());
            let durable = durable.unwrap_or_else(|| config.durable_name.clone());

            let pending = channel
                .pending_count(&subject, &durable)
                .await
                .map_err(|e| e.to_string())?;
            println!(
                "{}",
                serde_json::json!({
                    "cluster_id": channel.cluster_id(),
                    "subject": subject,
                    "durable_name": durable,
                    "pending": pending,
                })
            );
        }

        Command::Help => print_usage(),
    }

    Ok(())
}
