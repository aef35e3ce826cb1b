//! # Chess Graph Search
//!
//! Incrementally builds and searches a cache of engine-evaluated chess
//! positions to find the best continuation from a fixed starting position.
//! Individual evaluations come from an external UCI engine (the oracle)
//! and are stored once, then reused: the search itself never calls the
//! engine, it runs a negamax/alpha-beta traversal over the link graph
//! connecting cached positions.
//!
//! ## Features
//!
//! - **Append-only analysis cache**: SQLite-backed store of oracle
//!   evaluations keyed by canonical position identity
//! - **Link graph**: derived, rebuildable index of cached-position edges,
//!   with an all-or-nothing rule that keeps partially explored positions
//!   out of the search
//! - **Graph search**: negamax with alpha-beta pruning, path-local
//!   repetition detection, mate-distance bookkeeping and a history
//!   heuristic for move ordering
//! - **Deepening loop**: search, then extend the cache one ply along the
//!   best line, until a forced mate is proven or a stop is requested
//! - **Ply sweep**: breadth pass expanding every cached position at a
//!   given ply
//!
//! ## Quick Start
//!
//! ```rust
//! use chess_graph_search::{
//!     DrawPolicy, GraphSearch, LinkGraph, LinkMode, PositionRecord, PositionStore, ScoreType,
//! };
//!
//! fn cached(key: &str, score: i32) -> PositionRecord {
//!     PositionRecord {
//!         key: key.to_string(),
//!         start_fen: String::new(),
//!         ply: 0,
//!         moves: vec![],
//!         depth: 20,
//!         seldepth: 24,
//!         score_type: ScoreType::Centipawn,
//!         score,
//!         nodes: 1_000,
//!         tbhits: 0,
//!         time_ms: 10,
//!         pv: vec![],
//!         source_id: 1,
//!     }
//! }
//!
//! // Three cached positions: a root and its two known replies.
//! let mut store = PositionStore::empty();
//! store.insert_unsynced(cached("root", 0));
//! store.insert_unsynced(cached("after-m1", 40));
//! store.insert_unsynced(cached("after-m2", 10));
//!
//! let mut graph = LinkGraph::new(LinkMode::TwoSided);
//! graph.add_edge("root", "after-m1", "m1");
//! graph.add_edge("root", "after-m2", "m2");
//!
//! // The reply that is worst for the opponent is best for us.
//! let mut search = GraphSearch::new(DrawPolicy::Symmetric, None);
//! let outcome = search.search(&graph, &store, "root", chess::Color::White);
//! assert_eq!(outcome.score, -10);
//! assert_eq!(outcome.pv, vec!["m2".to_string()]);
//! ```

pub mod deepening;
pub mod errors;
pub mod links;
pub mod oracle;
pub mod record;
pub mod search;
pub mod store;

pub use deepening::{Analyzer, AnalyzerConfig, HuntOutcome, Side, SweepReport};
pub use errors::{GraphSearchError, Result};
pub use links::{LinkGraph, LinkMode, TerminalOutcome};
pub use oracle::{AnalysisBudget, EngineAnalysis, Oracle, UciOracle, UciOracleConfig};
pub use record::{
    board_from_key, key_from_fen, position_key, replay_moves, PositionKey, PositionRecord,
    ScoreType,
};
pub use search::{
    is_mate_score, unified_score, DrawPolicy, GraphSearch, SearchOutcome, DRAW_BIAS, MATE_SCORE,
    WORST_SCORE,
};
pub use store::{AnalysisDatabase, PositionStore};
