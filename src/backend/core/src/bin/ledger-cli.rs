//! Ledger CLI - Operator command-line interface for the Apex event ledger
//!
//! Inspects the event log, dispatches commands, drives projections by hand
//! and queries the read models.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use apex_ledger::{
    commands::CommandEnvelope,
    config::Config,
    db::Database,
    events::{AgentStatus, AggregateId, EventRecord, EventStore, TaskStatus},
    projections::{
        AgentQueries, AgentView, Checkpoint, CheckpointStore, ReadModelRepository, TaskQueries,
        TaskView,
    },
    telemetry::{init_logging, LogFormat},
    Runtime,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "ledger",
    version,
    about = "Apex Ledger - event log, command and projection tooling",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LEDGER_CONFIG")]
    config: Option<String>,

    /// Verbose output (library logs on stderr)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Show the global position of the newest event
    Position,

    /// Event log operations
    #[command(subcommand)]
    Events(EventCommands),

    /// Dispatch a JSON command envelope
    Dispatch {
        /// Envelope, e.g. '{"command":{"type":"RenameAgent","agent_id":"agent-1","name":"B"}}'
        envelope: String,
    },

    /// Run the projections by hand
    Project {
        /// Process a single batch and exit
        #[arg(long)]
        once: bool,

        /// Reset one projection and replay it from the start of the log
        #[arg(long, value_name = "PROJECTION")]
        rebuild: Option<String>,
    },

    /// List projection checkpoints
    Checkpoints,

    /// Agent read model queries
    #[command(subcommand)]
    Agents(AgentCommands),

    /// Task read model queries
    #[command(subcommand)]
    Tasks(TaskCommands),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Commands
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Subcommand)]
enum EventCommands {
    /// List events in global order
    List {
        /// Only events after this global position
        #[arg(long, default_value = "0")]
        from: u64,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Only events of this type
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
    },

    /// Show the stream of one aggregate
    Stream {
        /// Aggregate ID
        aggregate_id: String,

        /// Only versions after this one
        #[arg(long, default_value = "0")]
        from_version: u64,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Read Model Commands
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Subcommand)]
enum AgentCommands {
    /// List agents
    List {
        /// Filter by status (active, paused, retired)
        #[arg(short, long)]
        status: Option<AgentStatus>,

        /// Require a capability (repeatable)
        #[arg(short = 'C', long = "capability")]
        capabilities: Vec<String>,
    },

    /// Get details of a specific agent
    Get {
        /// Agent ID
        agent_id: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks
    List {
        /// Filter by status (pending, assigned, completed, cancelled)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Filter by assigned agent
        #[arg(short, long)]
        agent: Option<String>,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Data Types for Output
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Tabled)]
struct EventSummary {
    #[tabled(rename = "Position")]
    position: u64,
    #[tabled(rename = "Type")]
    event_type: String,
    #[tabled(rename = "Aggregate")]
    aggregate_id: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Occurred")]
    occurred_at: String,
}

impl From<&EventRecord> for EventSummary {
    fn from(record: &EventRecord) -> Self {
        Self {
            position: record.global_position,
            event_type: record.event_type().to_string(),
            aggregate_id: record.aggregate_id.to_string(),
            version: record.version,
            occurred_at: record.occurred_at().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct AgentSummary {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Capabilities")]
    capabilities: String,
    #[tabled(rename = "Tasks")]
    task_count: u32,
    #[tabled(rename = "Version")]
    version: u64,
}

impl From<&AgentView> for AgentSummary {
    fn from(view: &AgentView) -> Self {
        Self {
            id: view.id.clone(),
            name: view.name.clone(),
            model: view.model.clone(),
            status: format_agent_status(view.status),
            capabilities: view.capabilities.join(", "),
            task_count: view.task_count,
            version: view.version,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct TaskSummary {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Agent")]
    assigned_agent: String,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

impl From<&TaskView> for TaskSummary {
    fn from(view: &TaskView) -> Self {
        Self {
            id: view.id.clone(),
            title: view.title.clone(),
            status: format_task_status(view.status),
            priority: view.priority,
            assigned_agent: view.assigned_agent.clone().unwrap_or_else(|| "-".to_string()),
            updated_at: view.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct CheckpointSummary {
    #[tabled(rename = "Projection")]
    name: String,
    #[tabled(rename = "Position")]
    position: i64,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            name: checkpoint.name.clone(),
            position: checkpoint.position,
            updated_at: checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        if self.is_json() {
            println!("{}", serde_json::json!({ "status": "success", "message": message }));
        } else {
            println!("{} {}", "[OK]".green().bold(), message);
        }
    }

    fn print_error(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
        } else {
            eprintln!("{} {}", "[ERROR]".red().bold(), message);
        }
    }

    fn print_info(&self, message: &str) {
        if !self.is_json() {
            println!("{} {}", "[INFO]".blue().bold(), message);
        }
    }

    /// Table for `table`/`text`, a JSON array for `json`.
    fn print_rows<T: Tabled + Serialize>(&self, rows: &[T]) -> Result<()> {
        if self.is_json() {
            return self.print_json(&rows);
        }
        if rows.is_empty() {
            println!("{}", "No results found.".dimmed());
            return Ok(());
        }
        let mut table = Table::new(rows);
        table.with(Modify::new(Columns::first()).with(Alignment::left()));
        match self.format {
            OutputFormat::Table => table.with(Style::rounded()),
            _ => table.with(Style::blank()),
        };
        println!("{}", table);
        Ok(())
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if !self.is_json() {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }

    fn print_key_value(&self, key: &str, value: &str) {
        if !self.is_json() {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

fn format_agent_status(status: AgentStatus) -> String {
    let text = status.as_str();
    match status {
        AgentStatus::Active => text.green().to_string(),
        AgentStatus::Paused => text.yellow().to_string(),
        AgentStatus::Retired => text.dimmed().to_string(),
    }
}

fn format_task_status(status: TaskStatus) -> String {
    let text = status.as_str();
    match status {
        TaskStatus::Pending => text.yellow().to_string(),
        TaskStatus::Assigned => text.blue().bold().to_string(),
        TaskStatus::Completed => text.green().to_string(),
        TaskStatus::Cancelled => text.dimmed().to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn handle_events_command(cmd: EventCommands, runtime: &Runtime, output: &OutputHelper) -> Result<()> {
    match cmd {
        EventCommands::List { from, limit, event_type } => {
            let records = match event_type {
                Some(event_type) => {
                    runtime
                        .store()
                        .get_events_by_type(&event_type, from, Some(limit))
                        .await?
                }
                None => runtime.store().get_all_events(from, Some(limit)).await?,
            };

            if output.is_json() {
                return output.print_json(&records);
            }
            output.print_header("Events");
            let rows: Vec<EventSummary> = records.iter().map(EventSummary::from).collect();
            output.print_rows(&rows)?;
            if let Some(last) = records.last() {
                output.print_info(&format!(
                    "Showing {} events, continue with --from {}",
                    records.len(),
                    last.global_position
                ));
            }
        }

        EventCommands::Stream { aggregate_id, from_version } => {
            let id = AggregateId::new(aggregate_id);
            let records = runtime.store().get_events(&id, from_version).await?;

            if output.is_json() {
                return output.print_json(&records);
            }
            output.print_header(&format!("Stream: {}", id));
            for record in &records {
                println!(
                    "  {} {} {}",
                    format!("v{}", record.version).cyan(),
                    record.event_type().bold(),
                    format!("@{}", record.global_position).dimmed()
                );
                println!("      {}", serde_json::to_string(&record.event)?);
            }
            if records.is_empty() {
                println!("{}", "No events found.".dimmed());
            }
        }
    }

    Ok(())
}

async fn handle_dispatch(envelope: &str, runtime: &Runtime, output: &OutputHelper) -> Result<()> {
    let envelope = CommandEnvelope::from_json(envelope).context("Invalid command envelope")?;
    let outcome = runtime.dispatch(&envelope).await?;

    if output.is_json() {
        return output.print_json(&serde_json::json!({
            "command_id": envelope.id,
            "aggregate_id": outcome.aggregate_id,
            "version": outcome.version,
            "events": outcome.records,
        }));
    }

    if outcome.records.is_empty() {
        output.print_info("Command accepted, nothing changed");
    } else {
        output.print_success(&format!(
            "{} committed {} event(s)",
            envelope.command_type(),
            outcome.records.len()
        ));
    }
    output.print_key_value("Aggregate", outcome.aggregate_id.as_str());
    output.print_key_value("Version", &outcome.version.to_string());
    if let Some(position) = outcome.last_position() {
        output.print_key_value("Position", &position.to_string());
    }
    Ok(())
}

async fn handle_project(once: bool, rebuild: Option<String>, runtime: &Runtime, output: &OutputHelper) -> Result<()> {
    let mut processor = runtime.processor()?;
    processor.initialize().await?;

    if let Some(name) = rebuild {
        processor.rebuild(&name).await?;
        output.print_info(&format!("Projection '{}' reset", name));
    }

    let (mut fetched, mut applied, mut skipped) = (0usize, 0usize, 0usize);
    loop {
        let report = processor.run_once().await?;
        fetched += report.fetched;
        applied += report.applied;
        skipped += report.skipped;

        if !report.failed.is_empty() {
            anyhow::bail!(
                "Projection(s) {} failed at position {}",
                report.failed.join(", "),
                report.position
            );
        }
        if once || report.is_idle() {
            break;
        }
    }

    let position = processor.last_processed_position();
    if output.is_json() {
        return output.print_json(&serde_json::json!({
            "fetched": fetched,
            "applied": applied,
            "skipped": skipped,
            "position": position,
        }));
    }
    output.print_success(&format!(
        "Processed {} events ({} applied, {} skipped)",
        fetched, applied, skipped
    ));
    output.print_key_value("Position", &position.to_string());
    Ok(())
}

async fn handle_agents_command(cmd: AgentCommands, runtime: &Runtime, output: &OutputHelper) -> Result<()> {
    match cmd {
        AgentCommands::List { status, capabilities } => {
            let mut agents = if capabilities.is_empty() {
                match status {
                    Some(status) => runtime.agent_queries().find_by_status(status).await?,
                    None => runtime.agents().find_all().await?,
                }
            } else {
                runtime.agent_queries().find_with_capabilities(&capabilities).await?
            };
            if let (Some(status), false) = (status, capabilities.is_empty()) {
                agents.retain(|a| a.status == status);
            }

            if output.is_json() {
                return output.print_json(&agents);
            }
            output.print_header("Agents");
            let rows: Vec<AgentSummary> = agents.iter().map(AgentSummary::from).collect();
            output.print_rows(&rows)?;
        }

        AgentCommands::Get { agent_id } => {
            let agent = runtime
                .agents()
                .find_by_id(&agent_id)
                .await?
                .with_context(|| format!("Agent {} not found in read model", agent_id))?;

            if output.is_json() {
                return output.print_json(&agent);
            }
            output.print_header(&format!("Agent: {}", agent.id));
            output.print_key_value("Name", &agent.name);
            output.print_key_value("Model", &agent.model);
            output.print_key_value("Status", &format_agent_status(agent.status));
            output.print_key_value("Capabilities", &agent.capabilities.join(", "));
            output.print_key_value("Tasks", &agent.task_count.to_string());
            if let Some(reason) = &agent.retired_reason {
                output.print_key_value("Retired", reason);
            }
            output.print_key_value("Version", &agent.version.to_string());
            output.print_key_value("Position", &agent.last_processed_position.to_string());
            output.print_key_value("Created", &agent.created_at.to_rfc3339());
            output.print_key_value("Updated", &agent.updated_at.to_rfc3339());
        }
    }

    Ok(())
}

async fn handle_tasks_command(cmd: TaskCommands, runtime: &Runtime, output: &OutputHelper) -> Result<()> {
    let TaskCommands::List { status, agent } = cmd;

    let mut tasks = match (&agent, status) {
        (Some(agent), _) => runtime.task_queries().find_by_agent(agent).await?,
        (None, Some(status)) => runtime.task_queries().find_by_status(status).await?,
        (None, None) => runtime.tasks().find_all().await?,
    };
    if let (Some(status), Some(_)) = (status, &agent) {
        tasks.retain(|t| t.status == status);
    }

    if output.is_json() {
        return output.print_json(&tasks);
    }
    output.print_header("Tasks");
    let rows: Vec<TaskSummary> = tasks.iter().map(TaskSummary::from).collect();
    output.print_rows(&rows)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    if cli.verbose {
        config.logging.format = LogFormat::Compact;
        init_logging(&config.logging)?;
    }

    let db = Database::new(&config.database).await?;

    let command = match cli.command {
        Commands::Migrate => {
            db.migrate().await?;
            output.print_success("Migrations applied");
            return Ok(());
        }
        command => command,
    };

    let runtime = Runtime::postgres(&db, config)?;

    match command {
        Commands::Migrate => {}
        Commands::Position => {
            let position = runtime.store().get_last_position().await?;
            if output.is_json() {
                output.print_json(&serde_json::json!({ "position": position }))?;
            } else {
                println!("{}", position);
            }
        }
        Commands::Events(cmd) => handle_events_command(cmd, &runtime, output).await?,
        Commands::Dispatch { envelope } => handle_dispatch(&envelope, &runtime, output).await?,
        Commands::Project { once, rebuild } => handle_project(once, rebuild, &runtime, output).await?,
        Commands::Checkpoints => {
            let checkpoints = runtime.checkpoints().list().await?;
            if output.is_json() {
                output.print_json(&checkpoints)?;
            } else {
                output.print_header("Checkpoints");
                let rows: Vec<CheckpointSummary> = checkpoints.iter().map(CheckpointSummary::from).collect();
                output.print_rows(&rows)?;
            }
        }
        Commands::Agents(cmd) => handle_agents_command(cmd, &runtime, output).await?,
        Commands::Tasks(cmd) => handle_tasks_command(cmd, &runtime, output).await?,
    }

    db.pool().close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Create output helper
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
