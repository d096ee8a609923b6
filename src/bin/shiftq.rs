//! shiftq CLI: operator interface to the work coordinator.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shiftq::config::Config;
use shiftq::engine::Engine;
use shiftq::model::{NewWorkItem, Status, Timing, WorkId};
use shiftq::worker::CommandWorker;

#[derive(Parser)]
#[command(name = "shiftq", about = "Work coordinator with overnight batching")]
struct Cli {
    /// Path to a shiftq.toml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a work item
    Add {
        /// What needs doing
        description: String,
        /// Priority 1-10 (higher = more urgent)
        #[arg(long, default_value_t = 5)]
        priority: u8,
        /// Complexity estimate 1-10
        #[arg(long, default_value_t = 5)]
        complexity: u8,
        /// IDs (or prefixes) this item depends on
        #[arg(long = "depends")]
        depends: Vec<String>,
        /// Estimated budget units
        #[arg(long, default_value_t = 1)]
        quota: u32,
        /// Estimated minutes
        #[arg(long, default_value_t = 30)]
        minutes: u32,
        /// Budget tier
        #[arg(long)]
        tier: Option<String>,
        /// Timing override: sync, async, or flexible
        #[arg(long)]
        timing: Option<String>,
    },
    /// List work items
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a work item
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Admit eligible work up to the WIP limit
    Schedule,
    /// Mark a work item completed
    Complete { id: String },
    /// Report a work item failed
    Fail {
        id: String,
        #[arg(long, default_value = "failed by operator")]
        reason: String,
    },
    /// List items past the stall threshold
    Stalled,
    /// Recompute the WIP limit from trailing metrics
    Retune,
    /// Show the full coordinator status
    Status,
    /// Dry-run the deferred batch against the budget
    Forecast,
    /// Record consumed budget units against a tier
    Usage { tier: String, amount: u64 },
    /// Run the deferred batch with an external worker command
    Overnight {
        /// Executable run once per item (see worker env contract)
        #[arg(long)]
        worker: PathBuf,
    },
    /// Show audit events
    Events {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Add {
            description,
            priority,
            complexity,
            depends,
            quota,
            minutes,
            tier,
            timing,
        } => {
            let mut new = NewWorkItem::new(description)
                .priority(priority)
                .complexity(complexity)
                .estimated_quota(quota)
                .estimated_minutes(minutes);
            for dep in depends {
                new = new.depends_on(resolve_id(&engine, &dep)?);
            }
            if let Some(tier) = tier {
                new = new.tier(tier);
            }
            if let Some(timing) = timing {
                let timing: Timing = timing.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                new = new.timing(timing);
            }
            let item = engine.add_work(new)?;
            println!(
                "Added: {} (timing: {}, scheduled_for: {})",
                item.id,
                item.timing,
                item.scheduled_for
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Command::List { status } => {
            let status: Option<Status> = match status {
                Some(s) => Some(s.parse().map_err(|e: String| anyhow::anyhow!(e))?),
                None => None,
            };
            let items = engine.list(status)?;
            if items.is_empty() {
                println!("No work items found.");
                return Ok(());
            }
            println!(
                "{:<8}  {:<18}  {:<8}  {:<3}  {:<4}  {:<40}",
                "ID", "STATUS", "TIMING", "PRI", "TRY", "DESCRIPTION"
            );
            println!("{}", "-".repeat(90));
            for item in &items {
                let description = if item.description.len() > 40 {
                    &item.description[..40]
                } else {
                    &item.description
                };
                println!(
                    "{:<8}  {:<18}  {:<8}  {:<3}  {:<4}  {:<40}",
                    item.id.to_string(),
                    item.status.to_string(),
                    item.timing.to_string(),
                    item.priority,
                    item.retry_count,
                    description
                );
            }
            println!("\n{} item(s)", items.len());
        }
        Command::Show { id } => {
            let item = engine.get(resolve_id(&engine, &id)?)?;
            println!("ID:            {}", item.id.0);
            println!("Description:   {}", item.description);
            println!("Status:        {}", item.status);
            println!("Timing:        {}", item.timing);
            println!("Priority:      {}", item.priority);
            println!("Complexity:    {}", item.complexity);
            println!("Tier:          {}", item.tier);
            println!("Est. quota:    {}", item.estimated_quota);
            println!("Est. minutes:  {}", item.estimated_minutes);
            println!("Retries:       {}", item.retry_count);
            if !item.dependencies.is_empty() {
                let deps: Vec<String> = item.dependencies.iter().map(|d| d.to_string()).collect();
                println!("Depends on:    {}", deps.join(", "));
            }
            if let Some(ref agent) = item.agent {
                println!("Agent:         {agent}");
            }
            if let Some(ref reason) = item.failure_reason {
                println!("Last failure:  {reason}");
            }
            if let Some(ref location) = item.result_location {
                println!("Result:        {}", location.display());
            }
            println!("Created:       {}", item.created_at);
            if let Some(started) = item.started_at {
                println!("Started:       {started}");
            }
            if let Some(scheduled) = item.scheduled_for {
                println!("Scheduled for: {scheduled}");
            }
            if let Some(completed) = item.completed_at {
                println!("Completed:     {completed}");
            }
        }
        Command::Schedule => {
            let admitted = engine.schedule_next()?;
            if admitted.is_empty() {
                println!("Nothing admitted (no slot free or no eligible item).");
            }
            for item in admitted {
                println!("Admitted: {} {}", item.id, item.description);
            }
        }
        Command::Complete { id } => {
            let item = engine.complete_work(resolve_id(&engine, &id)?)?;
            println!("Completed: {}", item.id);
        }
        Command::Fail { id, reason } => {
            let item = engine.fail_work(resolve_id(&engine, &id)?, reason)?;
            println!("Failed: {} (status: {})", item.id, item.status);
        }
        Command::Stalled => {
            let reports = engine.find_stalled()?;
            if reports.is_empty() {
                println!("No stalled items.");
            }
            for report in reports {
                println!(
                    "STALLED {} active for {}m (agent: {}): {}",
                    report.id,
                    report.active_for.num_minutes(),
                    report.agent.as_deref().unwrap_or("-"),
                    report.description
                );
            }
        }
        Command::Retune => {
            let rec = engine.retune()?;
            println!(
                "wip_limit {} ({} mode; {:.1} completions/h, {:.0}% stall rate)",
                rec.wip_limit,
                rec.mode,
                rec.completion_rate_per_hour,
                rec.stall_rate * 100.0
            );
        }
        Command::Status => {
            let summary = engine.status_summary()?;
            println!(
                "wip_limit: {} (controller suggests {} in {} mode)",
                summary.wip_limit, summary.recommendation.wip_limit, summary.recommendation.mode
            );
            println!(
                "queued: {} ({} deferred)  active: {}  completed: {}  permanently_failed: {}",
                summary.queued,
                summary.deferred,
                summary.active,
                summary.completed,
                summary.permanently_failed
            );
            for tier in &summary.tiers {
                let limit = if tier.limit == 0 {
                    "unlimited".to_string()
                } else {
                    tier.limit.to_string()
                };
                println!(
                    "tier {}: used {} / {} (usable {}), resets {}",
                    tier.name,
                    tier.used,
                    limit,
                    tier.usable,
                    tier.resets_at.format("%Y-%m-%d %H:%M")
                );
            }
            for report in &summary.stalled {
                println!(
                    "WARNING stalled: {} active for {}m: {}",
                    report.id,
                    report.active_for.num_minutes(),
                    report.description
                );
            }
            for failure in &summary.permanent_failures {
                println!(
                    "PERMANENT FAILURE {} after {} tries: {} ({})",
                    failure.id, failure.retry_count, failure.description, failure.reason
                );
            }
        }
        Command::Forecast => {
            let forecast = engine.forecast()?;
            println!(
                "{} unit(s) requested across the deferred batch",
                forecast.total_requested
            );
            for id in &forecast.fits {
                println!("fits:     {id}");
            }
            for id in &forecast.deferred {
                println!("deferred: {id}");
            }
        }
        Command::Usage { tier, amount } => {
            let used = engine.record_usage(&tier, amount)?;
            println!("tier {tier}: used {used}");
        }
        Command::Overnight { worker } => {
            let mut worker = CommandWorker::new(worker);
            let summary = engine.run_overnight(&mut worker)?;
            println!(
                "completed: {}  requeued: {}  permanently_failed: {}  deferred_for_quota: {}",
                summary.completed.len(),
                summary.requeued.len(),
                summary.permanently_failed.len(),
                summary.deferred_for_quota.len()
            );
            if !summary.swept.is_empty() {
                println!("swept {} abandoned item(s)", summary.swept.len());
            }
            if summary.hit_cap {
                println!("wall-clock cap reached with work remaining");
            }
        }
        Command::Events { since } => {
            for event in engine.events_since(since)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}

/// Resolve a full UUID or unambiguous prefix to a work item ID.
fn resolve_id(engine: &Engine, id_str: &str) -> anyhow::Result<WorkId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id_str) {
        return Ok(WorkId(uuid));
    }
    let items = engine.list(None)?;
    let matches: Vec<WorkId> = items
        .iter()
        .filter(|item| item.id.0.to_string().starts_with(id_str))
        .map(|item| item.id)
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no work item matching prefix '{id_str}'"),
        1 => Ok(matches[0]),
        n => anyhow::bail!("{n} work items match prefix '{id_str}'; be more specific"),
    }
}
