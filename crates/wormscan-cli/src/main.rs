use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use wormscan_data::pipeline::{boot_check, Pipeline, PipelineOptions, RETRY_BACKOFF};
use wormscan_data::stats::Stats;
use wormscan_data::trace::TraceStrategy;
use wormscan_data::{BlockDecoder, Config, Node, Store};

#[derive(Parser, Debug)]
#[command(name = "wormscan")]
#[command(about = "Block explorer indexer for Wormholes/Erbie chains")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// SQLite file; overrides MYSQL_DSN.
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Node JSON-RPC endpoint; overrides CHAIN_URL.
    #[arg(long, global = true)]
    chain_url: Option<String>,

    /// Decoder workers; overrides THREAD.
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Reduce call frames on the node with a JS tracer instead of walking
    /// struct logs locally.
    #[arg(long, global = true)]
    js_tracer: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index the chain until interrupted.
    Run(RunArgs),
    /// Decode one block without writing it.
    Decode(DecodeArgs),
    /// Print the stored totals.
    Status(StatusArgs),
    /// Verify the node serves the chain stored in the database.
    Check,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Stop after committing this height.
    #[arg(long)]
    until: Option<u64>,

    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    #[arg(long)]
    block: u64,

    /// Print the whole decoded block as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Richest accounts to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
}

struct AppContext {
    config: Config,
    strategy: TraceStrategy,
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let mut config = Config::from_env().wrap_err("invalid environment configuration")?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(chain_url) = cli.chain_url {
        config.chain_url = chain_url;
    }
    if let Some(threads) = cli.threads {
        if threads == 0 {
            return Err(eyre!("--threads must be positive"));
        }
        config.threads = threads;
    }

    let ctx = AppContext {
        config,
        strategy: if cli.js_tracer {
            TraceStrategy::Tracer
        } else {
            TraceStrategy::StructLogs
        },
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run(args) => handle_run(&ctx, args).await,
        Commands::Decode(args) => handle_decode(&ctx, args).await,
        Commands::Status(args) => handle_status(&ctx, args),
        Commands::Check => handle_check(&ctx).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn connect(ctx: &AppContext) -> Result<Node> {
    Node::http(&ctx.config.chain_url, ctx.config.rpc_timeout)
        .wrap_err_with(|| format!("failed to create client for {}", ctx.config.chain_url))
}

async fn decoder(ctx: &AppContext, node: Node) -> Result<BlockDecoder> {
    let caps = node
        .capabilities()
        .await
        .wrap_err("failed to detect node capabilities")?;
    Ok(BlockDecoder::new(node, caps).with_trace(ctx.strategy, ctx.config.trace_cap))
}

async fn handle_run(ctx: &AppContext, args: RunArgs) -> Result<()> {
    let store = Store::open(&ctx.config.db_path, ctx.config.reset_db)
        .wrap_err("failed to open SQLite store")?;
    let node = connect(ctx)?;
    let decoder = decoder(ctx, node).await?;
    let identity = boot_check(decoder.node(), &store).await?;

    let options = PipelineOptions {
        workers: ctx.config.threads,
        interval: ctx.config.interval,
        backoff: RETRY_BACKOFF,
        stop_at: args.until,
    };
    let mut pipeline = Pipeline::new(decoder, store, options)?;
    pipeline.set_chain_id(identity.chain_id);

    if !ctx.quiet && !args.no_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} blocks ({per_sec})")
                .wrap_err("failed to create progress style")?
                .progress_chars("#>-"),
        );
        pipeline = pipeline.with_progress(pb);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping after in-flight blocks");
                stop_tx.send_replace(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for ctrl-c, run until done");
                std::future::pending::<()>().await;
            }
        }
    });

    info!(
        chain_url = %ctx.config.chain_url,
        db_path = %ctx.config.db_path,
        threads = ctx.config.threads,
        "indexer starting"
    );
    let finished = pipeline.run(stop_rx).await?;

    info!(
        next_height = finished.next_height,
        blocks = finished.stats.total_block,
        transactions = finished.stats.total_transaction,
        "indexer stopped"
    );
    Ok(())
}

async fn handle_decode(ctx: &AppContext, args: DecodeArgs) -> Result<()> {
    let node = connect(ctx)?;
    let decoder = decoder(ctx, node).await?;
    let parsed = decoder
        .decode(args.block)
        .await
        .wrap_err_with(|| format!("failed to decode block {}", args.block))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
        return Ok(());
    }

    let header = &parsed.block.header;
    let domain = &parsed.domain;
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Number".to_string(), header.number.to_string()]);
    table.add_row(vec!["Hash".to_string(), format!("{:#x}", header.hash)]);
    table.add_row(vec!["Parent".to_string(), format!("{:#x}", header.parent_hash)]);
    table.add_row(vec!["Miner".to_string(), format!("{:#x}", header.miner)]);
    table.add_row(vec!["Time".to_string(), format_time(header.timestamp)]);
    table.add_row(vec!["Transactions".to_string(), parsed.txs.len().to_string()]);
    table.add_row(vec!["Internal Txs".to_string(), parsed.internal_txs.len().to_string()]);
    table.add_row(vec!["Logs".to_string(), parsed.logs.len().to_string()]);
    table.add_row(vec!["Token Transfers".to_string(), parsed.transfers.len().to_string()]);
    table.add_row(vec!["Uncles".to_string(), parsed.uncles.len().to_string()]);
    table.add_row(vec!["Accounts".to_string(), parsed.accounts.len().to_string()]);
    table.add_row(vec!["NFTs Minted".to_string(), domain.nfts.len().to_string()]);
    table.add_row(vec!["NFT Txs".to_string(), domain.nft_txs.len().to_string()]);
    table.add_row(vec!["Rewards".to_string(), domain.rewards.len().to_string()]);
    table.add_row(vec!["Exchanger Changes".to_string(), domain.exchangers.len().to_string()]);
    table.add_row(vec!["Pledges".to_string(), domain.pledges.len().to_string()]);
    table.add_row(vec![
        "Epoch".to_string(),
        domain
            .epoch
            .as_ref()
            .map(|e| e.id.clone())
            .unwrap_or_else(|| "-".to_string()),
    ]);

    println!("\n{}\n", table);
    Ok(())
}

fn handle_status(ctx: &AppContext, args: StatusArgs) -> Result<()> {
    let store = Store::new(&ctx.config.db_path).wrap_err("failed to open SQLite store")?;
    let head = store.head().wrap_err("failed to query head")?;
    let stats = store.load_stats().wrap_err("failed to load stats")?;
    let chain_id = store.cache_get("chain_id")?.unwrap_or_else(|| "unknown".to_string());

    println!("\n{}\n", stats_table(&ctx.config.db_path, head.map(|(n, _)| n), &chain_id, &stats));

    if !stats.top_accounts.is_empty() && args.top > 0 {
        let mut top = Table::new();
        top.load_preset(UTF8_BORDERS_ONLY);
        top.set_header(vec!["#", "Address", "Balance (wei)"]);
        for (rank, account) in stats.top_accounts.iter().take(args.top).enumerate() {
            top.add_row(vec![
                (rank + 1).to_string(),
                account.address.clone(),
                account.balance.clone(),
            ]);
        }
        println!("{}\n", top);
    }

    info!(
        blocks = stats.total_block,
        transactions = stats.total_transaction,
        accounts = stats.total_account,
        "status printed"
    );
    Ok(())
}

async fn handle_check(ctx: &AppContext) -> Result<()> {
    let store = Store::new(&ctx.config.db_path).wrap_err("failed to open SQLite store")?;
    let node = connect(ctx)?;
    let caps = node
        .capabilities()
        .await
        .wrap_err("failed to detect node capabilities")?;
    let identity = boot_check(&node, &store).await?;
    let height = node.chain_height().await.wrap_err("failed to read chain height")?;
    let head = store.head()?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Node".to_string(), ctx.config.chain_url.clone()]);
    table.add_row(vec!["Chain ID".to_string(), identity.chain_id.to_string()]);
    table.add_row(vec!["Genesis".to_string(), format!("{:#x}", identity.genesis_hash)]);
    table.add_row(vec!["Debug Namespace".to_string(), yes_no(caps.debug)]);
    table.add_row(vec!["Wormholes Extensions".to_string(), yes_no(caps.domain)]);
    table.add_row(vec!["Chain Height".to_string(), height.to_string()]);
    table.add_row(vec![
        "Stored Head".to_string(),
        head.map(|(n, _)| n.to_string())
            .unwrap_or_else(|| "empty".to_string()),
    ]);
    println!("\n{}\n", table);
    Ok(())
}

fn stats_table(db_path: &str, head: Option<u64>, chain_id: &str, stats: &Stats) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);

    let db_size = if db_path == ":memory:" {
        "N/A (in-memory)".to_string()
    } else {
        match std::fs::metadata(db_path) {
            Ok(metadata) => format!("{} MB", metadata.len() / 1_000_000),
            Err(_) => "N/A (file not found)".to_string(),
        }
    };

    let rows: Vec<(&str, String)> = vec![
        ("Database Path", db_path.to_string()),
        ("DB Size", db_size),
        ("Chain ID", chain_id.to_string()),
        (
            "Head",
            head.map(|n| n.to_string())
                .unwrap_or_else(|| "No blocks in database".to_string()),
        ),
        ("Blocks", stats.total_block.to_string()),
        ("Black-hole Blocks", stats.total_black_hole.to_string()),
        ("Transactions", stats.total_transaction.to_string()),
        ("Plain Transfers", stats.total_transfer_tx.to_string()),
        ("Wormholes Txs", stats.total_wormholes_tx.to_string()),
        ("Internal Txs", stats.total_internal_tx.to_string()),
        ("Uncles", stats.total_uncle.to_string()),
        ("Accounts", stats.total_account.to_string()),
        ("Balance Sum (wei)", or_zero(&stats.total_balance)),
        ("Genesis Balance (wei)", or_zero(&stats.genesis_balance)),
        ("Exchangers", stats.total_exchanger.to_string()),
        ("NFTs", stats.total_nft.to_string()),
        ("SNFTs", stats.total_snft.to_string()),
        ("NFT Txs", stats.total_nft_tx.to_string()),
        ("SNFT Txs", stats.total_snft_tx.to_string()),
        ("Recycled SNFTs", stats.total_recycle.to_string()),
        ("Pledged (wei)", or_zero(&stats.total_pledge)),
        ("Coin Rewards", stats.total_reward_coin.to_string()),
        ("SNFT Rewards", stats.total_reward_snft.to_string()),
        ("First Block", format_time(stats.first_block_time)),
        ("Last Block", format_time(stats.last_block_time)),
        ("Avg Block Time", format!("{} ms", stats.avg_block_time_ms)),
    ];
    for (metric, value) in rows {
        table.add_row(vec![metric.to_string(), value]);
    }
    if let Some((day, count)) = stats.daily_tx.iter().next_back() {
        table.add_row(vec![format!("Txs on {day}"), count.to_string()]);
    }
    table
}

fn format_time(timestamp: u64) -> String {
    if timestamp == 0 {
        return "N/A".to_string();
    }
    chrono::DateTime::from_timestamp(timestamp as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn or_zero(value: &str) -> String {
    if value.is_empty() {
        "0".to_string()
    } else {
        value.to_string()
    }
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}
