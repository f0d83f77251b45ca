//! Command surface for driving the coordination core without a chat
//! front-end.
//!
//! Each mutating subcommand accepts an optional `--request-id`; when present
//! the command takes the interaction lease for that id before touching any
//! store, exactly as a front-end deduplicating redelivered events would.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::warn;
use tradehall_core::{
    parse_rfc3339_utc, CreateEscortRequest, CreateQuestRequest, CreateTradeRequest,
    RatingSentiment, RatingTargetRole, RecordSelector, SubmitRatingRequest, TradehallError,
    UpdateTradeItemsRequest,
};
use tradehall_store_json::{LeaseDir, TradeHall};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "th")]
#[command(about = "Tradehall trade and mission coordination CLI")]
pub struct Cli {
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Trade {
        #[command(subcommand)]
        command: Box<TradeCommand>,
    },
    Escort {
        #[command(subcommand)]
        command: Box<EscortCommand>,
    },
    Quest {
        #[command(subcommand)]
        command: Box<QuestCommand>,
    },
    Rep {
        #[command(subcommand)]
        command: Box<RepCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TradeCommand {
    Open(TradeOpenArgs),
    Items(TradeItemsArgs),
    Complete(TradeCompleteArgs),
    Cancel(TradeCancelArgs),
    Rate(TradeRateArgs),
}

#[derive(Debug, Subcommand)]
pub enum EscortCommand {
    Open(EscortOpenArgs),
    Complete(EscortCompleteArgs),
}

#[derive(Debug, Subcommand)]
pub enum QuestCommand {
    Open(QuestOpenArgs),
}

#[derive(Debug, Subcommand)]
pub enum RepCommand {
    Show(RepShowArgs),
    Migrate(RepMigrateArgs),
}

#[derive(Debug, Args)]
pub struct TradeOpenArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    buyer: String,
    #[arg(long)]
    items: String,
    #[arg(long)]
    price: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long, default_value = "cli-channel")]
    channel: String,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TradeItemsArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    items: String,
    #[arg(long)]
    trade_id: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TradeCompleteArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    trade_id: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TradeCancelArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    trade_id: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TradeRateArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    result: SentimentArg,
    #[arg(long)]
    target: Option<RoleArg>,
    #[arg(long)]
    trade_id: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    comments: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EscortOpenArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    route: String,
    #[arg(long)]
    payment: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long, default_value = "cli-channel")]
    channel: String,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EscortCompleteArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    escort_id: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct QuestOpenArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long, default_value_t = 1)]
    reward_rep: i64,
    #[arg(long)]
    reward_items: Option<String>,
    #[arg(long)]
    deadline: Option<String>,
    #[arg(long)]
    assignee: Option<String>,
    #[arg(long, default_value = "cli-channel")]
    channel: String,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RepShowArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RepMigrateArgs {
    #[arg(long)]
    legacy: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SentimentArg {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Seller,
    Buyer,
}

/// Installs the stderr tracing subscriber; stdout is reserved for command
/// payloads.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when a lifecycle operation refuses the request or when
/// storage access fails; the error text is the single user-facing message.
pub fn run_cli(cli: Cli) -> Result<()> {
    let hall = TradeHall::open(&cli.data_dir);
    let leases = LeaseDir::new(cli.data_dir.join("locks"));
    run_command(cli.command, &hall, &leases)
}

/// Executes a parsed command against an existing service instance.
///
/// # Errors
/// Returns an error when the requested operation fails.
pub fn run_command(command: Command, hall: &TradeHall, leases: &LeaseDir) -> Result<()> {
    match command {
        Command::Trade { command } => run_trade(*command, hall, leases),
        Command::Escort { command } => run_escort(*command, hall, leases),
        Command::Quest { command } => run_quest(*command, hall, leases),
        Command::Rep { command } => run_rep(*command, hall),
    }
}

fn run_trade(command: TradeCommand, hall: &TradeHall, leases: &LeaseDir) -> Result<()> {
    match command {
        TradeCommand::Open(args) => {
            let request = CreateTradeRequest {
                interaction_id: args.request_id.clone(),
                buyer_id: args.buyer,
                item_input: args.items,
                price: args.price,
                notes: args.notes,
                channel_id: args.channel,
                thread_id: args
                    .thread
                    .unwrap_or_else(|| format!("cli-thread-{}", Ulid::new())),
                summary_message_id: None,
            };
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.create_trade(&args.actor, &request)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
        TradeCommand::Items(args) => {
            let request = UpdateTradeItemsRequest {
                trade: selector(args.trade_id.as_deref(), args.thread)?,
                items_input: args.items,
                reason: args.reason,
            };
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.update_trade_items(&args.actor, &request)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
        TradeCommand::Complete(args) => {
            let trade = selector(args.trade_id.as_deref(), args.thread)?;
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.mark_trade_complete(&args.actor, &trade)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
        TradeCommand::Cancel(args) => {
            let trade = selector(args.trade_id.as_deref(), args.thread)?;
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.cancel_trade(&args.actor, &trade, args.reason.as_deref())
            })?;
            emit(&reply, &reply.lines, args.json)
        }
        TradeCommand::Rate(args) => {
            let request = SubmitRatingRequest {
                trade: selector(args.trade_id.as_deref(), args.thread)?,
                target_role: args.target.map(map_role),
                sentiment: map_sentiment(args.result),
                comments: args.comments,
            };
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.submit_rating(&args.actor, &request)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
    }
}

fn run_escort(command: EscortCommand, hall: &TradeHall, leases: &LeaseDir) -> Result<()> {
    match command {
        EscortCommand::Open(args) => {
            let request = CreateEscortRequest {
                interaction_id: args.request_id.clone(),
                client_id: args.client,
                route: args.route,
                payment: args.payment,
                notes: args.notes,
                channel_id: args.channel,
                thread_id: args
                    .thread
                    .unwrap_or_else(|| format!("cli-thread-{}", Ulid::new())),
            };
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.create_escort(&args.actor, &request)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
        EscortCommand::Complete(args) => {
            let escort = selector(args.escort_id.as_deref(), args.thread)?;
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.complete_escort(&args.actor, &escort)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
    }
}

fn run_quest(command: QuestCommand, hall: &TradeHall, leases: &LeaseDir) -> Result<()> {
    match command {
        QuestCommand::Open(args) => {
            let deadline = match args.deadline.as_deref() {
                Some(raw) => Some(
                    parse_rfc3339_utc(raw)
                        .with_context(|| format!("invalid --deadline value: {raw}"))?,
                ),
                None => None,
            };
            let request = CreateQuestRequest {
                interaction_id: args.request_id.clone(),
                title: args.title,
                description: args.description,
                reward_rep: args.reward_rep,
                reward_items: args.reward_items,
                deadline,
                assignee_id: args.assignee,
                channel_id: args.channel,
                thread_id: args
                    .thread
                    .unwrap_or_else(|| format!("cli-thread-{}", Ulid::new())),
            };
            let reply = with_lease(leases, args.request_id.as_deref(), || {
                hall.create_quest(&args.actor, &request)
            })?;
            emit(&reply, &reply.lines, args.json)
        }
    }
}

fn run_rep(command: RepCommand, hall: &TradeHall) -> Result<()> {
    match command {
        RepCommand::Show(args) => {
            let reply = hall.reputation_summary(&args.user);
            emit(&reply, &reply.lines, args.json)
        }
        RepCommand::Migrate(args) => {
            let report = hall.migrate_legacy_ratings(&args.legacy)?;
            emit(&report, &report.lines, args.json)
        }
    }
}

/// Runs `op` under the interaction lease for `request_id`, if one was
/// supplied. Contention is surfaced as the retry-shortly failure without
/// invoking the operation.
fn with_lease<T>(
    leases: &LeaseDir,
    request_id: Option<&str>,
    op: impl FnOnce() -> Result<T, TradehallError>,
) -> Result<T, TradehallError> {
    let Some(request_id) = request_id else {
        return op();
    };

    let lease = leases
        .acquire(request_id)
        .map_err(|err| TradehallError::Storage(format!("{err:#}")))?;
    let Some(lease) = lease else {
        return Err(TradehallError::LeaseContention);
    };

    let result = op();
    if let Err(err) = lease.release() {
        warn!(request_id, error = %err, "failed to release interaction lease");
    }
    result
}

fn selector(record_id: Option<&str>, thread_id: Option<String>) -> Result<RecordSelector> {
    let record_id = match record_id {
        Some(raw) => Some(
            Ulid::from_string(raw).with_context(|| format!("invalid record id: {raw}"))?,
        ),
        None => None,
    };
    Ok(RecordSelector {
        record_id,
        thread_id,
    })
}

fn map_sentiment(value: SentimentArg) -> RatingSentiment {
    match value {
        SentimentArg::Positive => RatingSentiment::Positive,
        SentimentArg::Negative => RatingSentiment::Negative,
    }
}

fn map_role(value: RoleArg) -> RatingTargetRole {
    match value {
        RoleArg::Seller => RatingTargetRole::Seller,
        RoleArg::Buyer => RatingTargetRole::Buyer,
    }
}

fn emit<T: Serialize>(payload: &T, lines: &[String], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(payload)?);
    } else {
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}
