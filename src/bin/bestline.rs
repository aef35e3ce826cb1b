use chess_graph_search::{
    board_from_key, is_mate_score, replay_moves, AnalysisDatabase, DrawPolicy, GraphSearch,
    LinkGraph, LinkMode, PositionStore, Side, MATE_SCORE,
};
use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Analysis database path
    #[arg(short, long, default_value = "chess.db")]
    database: String,

    /// Walk live legal moves instead of the prebuilt link graph
    #[arg(long)]
    no_links: bool,

    /// Only explore deviations for this side (white|black)
    #[arg(long)]
    study_side: Option<String>,

    /// Score repetitions as lost for this side (white|black)
    #[arg(long)]
    draw_lost: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let study_side = args
        .study_side
        .as_deref()
        .map(Side::parse)
        .transpose()?
        .map(Side::color);
    let draw_policy = match args.draw_lost.as_deref().map(Side::parse).transpose()? {
        Some(side) => DrawPolicy::BiasAgainst(side.color()),
        None => DrawPolicy::Symmetric,
    };

    let db = AnalysisDatabase::open(&args.database)?;
    let store = PositionStore::load(&db)?;
    let Some(root) = store.root().cloned() else {
        eprintln!(
            "{} holds no ply-0 record; run hunt or sweep first",
            args.database
        );
        std::process::exit(1);
    };

    println!("Chess Graph Search - Best Line");
    println!("==============================");
    println!("  • Database: {} ({} positions)", args.database, store.len());
    println!("  • Root: {}", root.key);
    println!();

    let mut search = GraphSearch::new(draw_policy, study_side);
    let outcome = if args.no_links {
        let board = replay_moves(&root.start_fen, &[])?;
        search.search_board(&store, &board)
    } else {
        let mode = match study_side {
            Some(side) => LinkMode::OneSide(side),
            None => LinkMode::TwoSided,
        };
        let graph = LinkGraph::build(&store, mode)?;
        println!(
            "Link graph: {} edges over {} linked positions",
            graph.edge_count(),
            graph.linked_position_count()
        );
        let board = board_from_key(&root.key)?;
        search.search(&graph, &store, &root.key, board.side_to_move())
    };

    if is_mate_score(outcome.score) {
        let plies = MATE_SCORE - outcome.score.abs();
        let verdict = if outcome.score > 0 { "winning" } else { "losing" };
        println!(
            "Score: {} for the side to move (mate in {} plies)",
            verdict, plies
        );
    } else {
        println!("Score: {:.2} pawns for the side to move", outcome.score as f64 / 100.0);
    }
    println!("Nodes: {}", outcome.nodes);
    println!("Line: {}", outcome.pv.join(" "));
    Ok(())
}
