//! Two agents talking over the mesh: direct message, request, handoff and
//! broadcast.

use std::sync::Arc;
use std::time::Duration;

use agent_mesh::config::MessagingConfig;
use agent_mesh::kernel::{AgentBehavior, BehaviorError, BehaviorResult, MeshObserver, MessagingClient};
use agent_mesh::primitives::{AgentName, MessageEnvelope};
use agent_mesh::telemetry::tracing_support;
use agent_mesh::transport::{MemoryBroker, TransportConfig, TransportSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "mesh-demo")]
#[command(about = "Exercise the agent mesh against NATS or an in-process broker", long_about = None)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration, then connect to the server and
    /// report the session state
    Check,

    /// Run the two-agent walkthrough
    Walkthrough {
        /// Use the in-process broker instead of NATS
        #[arg(long)]
        memory: bool,
    },
}

struct Calculator;

#[async_trait]
impl AgentBehavior for Calculator {
    fn handle_request(&self, content: &str) -> BehaviorResult {
        let expression = content.trim_end_matches('?');
        let (lhs, rhs) = expression
            .split_once('+')
            .ok_or_else(|| BehaviorError::failed(format!("cannot evaluate '{content}'")))?;
        let parse = |side: &str| {
            side.trim()
                .parse::<i64>()
                .map_err(|err| BehaviorError::failed(err.to_string()))
        };
        Ok((parse(lhs)? + parse(rhs)?).to_string())
    }

    async fn handle_kickoff(&self, content: &str) -> BehaviorResult {
        info!(task = content, "calculator picked up task");
        Ok(format!("done: {content}"))
    }
}

struct Coordinator;

#[async_trait]
impl AgentBehavior for Coordinator {
    fn handle_request(&self, content: &str) -> BehaviorResult {
        Ok(format!("coordinator saw '{content}'"))
    }

    async fn handle_kickoff(&self, content: &str) -> BehaviorResult {
        Ok(content.to_owned())
    }
}

struct Printer;

#[async_trait]
impl MeshObserver for Printer {
    async fn on_announcement(&self, envelope: &MessageEnvelope) {
        info!(from = %envelope.from_agent, content = %envelope.content, "announcement");
    }

    async fn on_completion(&self, envelope: &MessageEnvelope) {
        info!(from = %envelope.from_agent, content = %envelope.content, "task completed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_support::init(&cli.log);

    let config = MessagingConfig::from_env().context("invalid messaging environment")?;
    match cli.command {
        Command::Check => check(&config).await,
        Command::Walkthrough { memory } => walkthrough(config, memory).await,
    }
}

async fn check(config: &MessagingConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    let connector = agent_mesh::transport::NatsConnector::shared();
    let session = TransportSession::new(connector, TransportConfig::from(config));
    session
        .connect()
        .await
        .with_context(|| format!("cannot reach {}", config.server_address()))?;
    info!(server = %config.server_address(), state = ?session.state(), "connection ok");
    session.close().await?;
    Ok(())
}

async fn walkthrough(config: MessagingConfig, memory: bool) -> Result<()> {
    let broker = memory.then(MemoryBroker::new);
    let build = |name: &str, behavior: Arc<dyn AgentBehavior>| -> Result<MessagingClient> {
        let mut builder = MessagingClient::builder(AgentName::new(name)?, behavior)
            .config(config.clone())
            .observer(Arc::new(Printer))
            .tools(["calculator"]);
        if let Some(broker) = &broker {
            builder = builder.connector(broker.connector());
        }
        Ok(builder.build()?)
    };

    let calculator = build("Calculator", Arc::new(Calculator))?;
    let coordinator = build("Coordinator", Arc::new(Coordinator))?;

    calculator
        .connect(vec!["arithmetic".into()], "Adds numbers")
        .await?;
    coordinator
        .connect(vec!["planning".into()], "Routes work")
        .await?;

    coordinator
        .send_direct_message("Calculator", "warm up", None)
        .await?;

    let answer = coordinator
        .request_from_agent("Calculator", "2+2?", Some(Duration::from_secs(5)))
        .await?;
    info!(?answer, "calculator answered");

    let unanswered = coordinator
        .request_from_agent("Nobody", "hello?", Some(Duration::from_millis(500)))
        .await?;
    info!(?unanswered, "request to a missing agent");

    coordinator
        .handoff_to_agent("Calculator", "sum the invoices", None)
        .await?;
    coordinator
        .broadcast_message("planning round starts", None)
        .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    for peer in coordinator.peers().online_peers() {
        info!(peer = %peer.name(), status = %peer.status(), "online peer");
    }

    coordinator.disconnect().await?;
    calculator.disconnect().await?;
    Ok(())
}
