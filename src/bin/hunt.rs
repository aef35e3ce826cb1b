use chess_graph_search::{
    Analyzer, AnalyzerConfig, HuntOutcome, Oracle, Side, UciOracle, UciOracleConfig, MATE_SCORE,
};
use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON run configuration; the flags below override it
    #[arg(short, long)]
    config: Option<String>,

    /// Analysis database path
    #[arg(short, long)]
    database: Option<String>,

    /// UCI engine used to score positions
    #[arg(short, long, default_value = "stockfish")]
    engine: String,

    /// Second UCI engine asked for the true line at positions where the
    /// non-studied side is to move
    #[arg(long)]
    pv_engine: Option<String>,

    /// Oracle thinking budget per position, in nodes
    #[arg(short, long)]
    nodes: Option<u64>,

    /// Only explore deviations for this side (white|black)
    #[arg(long)]
    study_side: Option<String>,

    /// Score repetitions as lost for this side (white|black)
    #[arg(long)]
    draw_lost: Option<String>,

    /// Syzygy tablebase directory handed to the engines
    #[arg(long)]
    syzygy: Option<String>,

    /// Starting position FEN
    #[arg(long)]
    start_fen: Option<String>,
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
    if let Some(side) = &args.draw_lost {
        config.draw_lost_side = Some(Side::parse(side)?);
    }
    if let Some(fen) = args.start_fen {
        config.start_fen = fen;
    }

    println!("Chess Graph Search - Mate Hunt");
    println!("==============================");
    println!("  • Database: {}", config.db_path);
    println!("  • Engine: {}", args.engine);
    println!("  • Node budget: {}", config.node_budget);
    if let Some(side) = config.study_side {
        println!("  • Studying deviations for: {:?}", side);
    }
    if let Some(side) = config.draw_lost_side {
        println!("  • Repetitions count as lost for: {:?}", side);
    }
    println!("  • Stop by creating: {}", config.break_file);
    println!();

    let scorer = UciOracle::launch(UciOracleConfig {
        engine_path: args.engine.clone(),
        hash_mb: 1024,
        syzygy_path: args.syzygy.clone(),
        source_id: 2,
    })?;
    let pv_oracle: Option<Box<dyn Oracle>> = match &args.pv_engine {
        Some(path) => Some(Box::new(UciOracle::launch(UciOracleConfig {
            engine_path: path.clone(),
            hash_mb: 1024,
            syzygy_path: args.syzygy.clone(),
            source_id: 3,
        })?)),
        None => None,
    };

    let mut analyzer = Analyzer::new(config, Box::new(scorer), pv_oracle)?;
    match analyzer.hunt()? {
        HuntOutcome::MateFound { score, line } => {
            let plies = MATE_SCORE - score.abs();
            println!();
            println!(
                "Forced mate in {} plies after {} oracle calls:",
                plies,
                analyzer.oracle_calls()
            );
            println!("{}", line.join(" "));
        }
        HuntOutcome::Cancelled { last } => {
            println!();
            println!(
                "Stopped on request; best line so far scores {}:",
                last.score
            );
            println!("{}", last.pv.join(" "));
        }
    }
    Ok(())
}
