use chess_graph_search::{Analyzer, AnalyzerConfig, Side, UciOracle, UciOracleConfig};
use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Expand the cached positions at this ply
    ply: u32,

    /// JSON run configuration; the flags below override it
    #[arg(short, long)]
    config: Option<String>,

    /// Analysis database path
    #[arg(short, long)]
    database: Option<String>,

    /// UCI engine used to score positions
    #[arg(short, long, default_value = "stockfish")]
    engine: String,

    /// Oracle thinking budget per position, in nodes
    #[arg(short, long)]
    nodes: Option<u64>,

    /// Only expand records scoring below this many centipawns
    #[arg(long)]
    cp_limit: Option<i32>,

    /// Expand each record's own replies instead of stepping one move down
    /// its cached line first
    #[arg(long)]
    full_width: bool,

    /// Only explore deviations for this side (white|black)
    #[arg(long)]
    study_side: Option<String>,

    /// Syzygy tablebase directory handed to the engine
    #[arg(long)]
    syzygy: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AnalyzerConfig::from_json_file(path)?,
        None => AnalyzerConfig::default(),
    };
    if let Some(database) = args.database {
        config.db_path = database;
    }
    if let Some(nodes) = args.nodes {
        config.node_budget = nodes;
    }
    if let Some(side) = &args.study_side {
        config.study_side = Some(Side::parse(side)?);
    }
    if args.full_width {
        config.best_move_only = false;
    }

    println!("Chess Graph Search - Ply Sweep");
    println!("==============================");
    println!("  • Database: {}", config.db_path);
    println!("  • Engine: {}", args.engine);
    println!("  • Ply: {}", args.ply);
    println!("  • Node budget: {}", config.node_budget);
    if let Some(limit) = args.cp_limit {
        println!("  • Only records below: {} cp", limit);
    }
    println!();

    let scorer = UciOracle::launch(UciOracleConfig {
        engine_path: args.engine.clone(),
        hash_mb: 1024,
        syzygy_path: args.syzygy.clone(),
        source_id: 2,
    })?;

    let mut analyzer = Analyzer::new(config, Box::new(scorer), None)?;
    let report = analyzer.sweep(args.ply, args.cp_limit)?;

    println!();
    println!("Examined {} records:", report.examined);
    println!("  • New positions: {}", report.new_positions);
    println!("  • New mates: {}", report.new_mates);
    if args.cp_limit.is_some() {
        println!("  • Below the limit: {}", report.below_limit);
    }
    println!("  • Already cached: {}", report.already_cached);
    println!("  • Already mate: {}", report.already_mate);
    if report.cancelled {
        println!("Stopped on request; everything analysed so far is committed.");
    }
    Ok(())
}
