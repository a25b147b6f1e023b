// SPDX-License-Identifier: MIT

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use plangraph_rs::adk::capability::{Capability, CapabilityCall, CapabilityPool};
use plangraph_rs::adk::embedding::openai::OpenAIEmbedder;
use plangraph_rs::adk::error::ExternalError;
use plangraph_rs::adk::reasoner::{Decision, Message, Reasoner, Role};
use plangraph_rs::plangraph::workflow::topology::approval::{self, ApprovalDecision};
use plangraph_rs::plangraph::workflow::topology::config::{ConfigLoader, EngineConfig};
use plangraph_rs::plangraph::workflow::ranker::CapabilityRanker;
use plangraph_rs::plangraph::workflow::topology::plan::{Plan, StaticPlanner};
use plangraph_rs::plangraph::workflow::topology::{fields, initial_input, PlanExecuteTopology};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a plan against a request
    Run {
        /// Path to the plan YAML
        #[arg(short, long)]
        plan: String,

        /// The request to work on
        #[arg(short, long)]
        input: String,

        /// Path to the engine config YAML
        #[arg(short, long)]
        config: Option<String>,

        /// Approve every request without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Thread id
        #[arg(short, long, default_value = "cli")]
        thread: String,
    },
    /// Validate an engine config file and print the effective values
    CheckConfig {
        #[arg(short, long)]
        config: String,
    },
}

/// Current UTC time
struct ClockCapability;

#[async_trait]
impl Capability for ClockCapability {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC"
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ExternalError> {
        Ok(json!(chrono::Utc::now().to_rfc3339()))
    }
}

/// Prints a note to standard output
struct NoteCapability;

#[async_trait]
impl Capability for NoteCapability {
    fn name(&self) -> &str {
        "write_note"
    }

    fn description(&self) -> &str {
        "Write a note for the operator"
    }

    fn side_effecting(&self) -> bool {
        true
    }

    async fn invoke(&self, args: Value) -> Result<Value, ExternalError> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        println!("NOTE: {}", text);
        Ok(json!("note written"))
    }
}

/// Offline reasoner: calls a capability the step names once, otherwise
/// answers with the step description
struct EchoReasoner;

#[async_trait]
impl Reasoner for EchoReasoner {
    async fn decide(
        &self,
        context: &[Message],
        available: &[Arc<dyn Capability>],
    ) -> Result<Decision, ExternalError> {
        let instruction = context
            .first()
            .map(|m| m.content.lines().next().unwrap_or_default().to_string())
            .unwrap_or_default();

        if let Some(last) = context.last().filter(|m| m.role == Role::Capability) {
            return Ok(Decision::answer(format!("{} -> {}", instruction, last.content)));
        }

        let already_called = |name: &str| {
            context
                .iter()
                .any(|m| m.capability_calls.iter().any(|c| c.name == name))
        };
        let lowered = instruction.to_lowercase().replace(' ', "_");
        if let Some(capability) = available
            .iter()
            .find(|c| lowered.contains(c.name()) && !already_called(c.name()))
        {
            let call = CapabilityCall::new("", capability.name(), json!({ "text": instruction }));
            return Ok(Decision::call(
                format!("Calling {}", capability.name()),
                vec![call],
            ));
        }

        Ok(Decision::answer(format!("Done: {}", instruction)))
    }
}

fn ranker(config: &EngineConfig) -> CapabilityRanker {
    if std::env::var("OPENAI_API_KEY").is_err() {
        return CapabilityRanker::lexical();
    }
    match OpenAIEmbedder::new(None) {
        Ok(embedder) => {
            log::info!("Ranking capabilities with OpenAI embeddings");
            CapabilityRanker::new(Some(Arc::new(embedder)))
                .with_retry(config.retry.clone())
                .with_timeout(config.capability_timeout())
        }
        Err(e) => {
            log::warn!("Failed to create embedder, using lexical ranking: {}", e);
            CapabilityRanker::lexical()
        }
    }
}

async fn ask(summary: &str) -> anyhow::Result<bool> {
    println!("{}", summary);
    println!("Approve? [y/N]");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            plan,
            input,
            config,
            auto_approve,
            thread,
        } => {
            let content = std::fs::read_to_string(&plan)
                .with_context(|| format!("reading plan {}", plan))?;
            let plan = Plan::from_yaml(&content).context("parsing plan")?;
            let config = match config {
                Some(path) => ConfigLoader::new().load(&path)?,
                None => EngineConfig::default(),
            };

            let pool = CapabilityPool::from_capabilities([
                Arc::new(ClockCapability) as Arc<dyn Capability>,
                Arc::new(NoteCapability),
            ])?;
            let runtime = PlanExecuteTopology::new(
                Arc::new(StaticPlanner::new(plan)),
                Arc::new(EchoReasoner),
                pool,
            )
            .with_ranker(ranker(&config))
            .with_config(config)
            .into_runtime()?;

            let mut result = runtime.start(&thread, initial_input(&input)).await?;
            while result.is_suspended() {
                let request = approval::current_request(&result.state)?
                    .context("thread suspended without an approval request")?;
                let approved = auto_approve || ask(&request.summary).await?;
                let decision = if approved {
                    ApprovalDecision::approve(request.id)
                } else {
                    ApprovalDecision::deny(request.id)
                };
                result = runtime.resume(&thread, decision.into_patch()).await?;
            }

            let messages: Vec<Message> = result
                .state
                .get_as(fields::MESSAGES)?
                .unwrap_or_default();
            if let Some(answer) = messages.last() {
                println!("Response: {}", answer.content);
            }
            println!(
                "Stage: {}",
                result.state.get_str(fields::STAGE).unwrap_or("unknown")
            );
        }
        Commands::CheckConfig { config } => {
            let config = ConfigLoader::new().load(&config)?;
            println!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
