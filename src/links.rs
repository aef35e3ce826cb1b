use chess::{BoardStatus, ChessMove, Color, MoveGen};
use rayon::prelude::*;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

use crate::errors::{GraphSearchError, Result};
use crate::record::{board_from_key, position_key, PositionKey, PositionRecord};
use crate::store::PositionStore;

/// Which successor edges the builder derives for each cached position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Link a position only when every one of its legal moves leads to a
    /// cached position. A partially explored position gets no edges at all,
    /// so the search never sees a biased subset of its replies.
    TwoSided,
    /// Restricted variant for studying one player's deviations: positions
    /// where the *other* side is to move get exactly one edge, following the
    /// cached principal variation. Positions where the studied side is to
    /// move fall back to the two-sided rule.
    OneSide(Color),
}

/// Rules outcome of a position with no legal continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// Side to move is checkmated.
    Checkmate,
    Stalemate,
}

type EdgeList = Vec<(String, PositionKey)>;

/// Directed graph of cached-position -> cached-position edges labeled by
/// the move that transforms one into the other.
///
/// This is a derived, rebuildable index over the store, never persisted.
/// Rebuilds are idempotent: the same store contents always produce the
/// same graph.
pub struct LinkGraph {
    mode: LinkMode,
    edges: HashMap<PositionKey, HashMap<PositionKey, String>>,
    terminals: HashMap<PositionKey, TerminalOutcome>,
    edge_count: usize,
}

impl LinkGraph {
    /// An empty graph, extended by hand with [`LinkGraph::add_edge`].
    pub fn new(mode: LinkMode) -> Self {
        Self {
            mode,
            edges: HashMap::new(),
            terminals: HashMap::new(),
            edge_count: 0,
        }
    }

    /// Derive the full graph from the current store contents.
    pub fn build(store: &PositionStore, mode: LinkMode) -> Result<Self> {
        let t0 = Instant::now();
        let records: Vec<&PositionRecord> = store.records().collect();

        // The per-position legal-move scan dominates rebuild time and each
        // position is independent, so fan it out.
        let scanned: Result<Vec<(PositionKey, EdgeList, Option<TerminalOutcome>)>> = records
            .par_iter()
            .map(|record| {
                let (edges, terminal) = successor_edges(store, record, mode)?;
                Ok((record.key.clone(), edges, terminal))
            })
            .collect();

        let mut graph = Self::new(mode);
        for (key, edges, terminal) in scanned? {
            if let Some(outcome) = terminal {
                graph.terminals.insert(key.clone(), outcome);
            }
            for (mv, target) in edges {
                graph.add_edge(&key, &target, &mv);
            }
        }

        log::debug!(
            "{} links over {} positions built in {:.3}s",
            graph.edge_count,
            store.len(),
            t0.elapsed().as_secs_f64()
        );
        Ok(graph)
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Known successors of a position: target key -> move. `None` means the
    /// position is a search-horizon leaf.
    pub fn successors(&self, key: &str) -> Option<&HashMap<PositionKey, String>> {
        self.edges.get(key)
    }

    /// Rules-terminal outcome recorded for a position at build time.
    pub fn terminal(&self, key: &str) -> Option<TerminalOutcome> {
        self.terminals.get(key).copied()
    }

    /// Add a single edge. Used by the orchestrator to extend the graph as
    /// freshly analysed successors arrive between rebuilds.
    pub fn add_edge(&mut self, from: &str, to: &str, mv: &str) {
        let targets = self.edges.entry(from.to_string()).or_default();
        if targets.insert(to.to_string(), mv.to_string()).is_none() {
            self.edge_count += 1;
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Number of positions with at least one outgoing edge.
    pub fn linked_position_count(&self) -> usize {
        self.edges.len()
    }
}

/// Compute the successor edges of one cached position under the given mode,
/// along with its terminal outcome when it has no legal continuation.
fn successor_edges(
    store: &PositionStore,
    record: &PositionRecord,
    mode: LinkMode,
) -> Result<(EdgeList, Option<TerminalOutcome>)> {
    let board = board_from_key(&record.key)?;

    let mut legal = MoveGen::new_legal(&board).peekable();
    if legal.peek().is_none() {
        let outcome = match board.status() {
            BoardStatus::Checkmate => TerminalOutcome::Checkmate,
            _ => TerminalOutcome::Stalemate,
        };
        return Ok((Vec::new(), Some(outcome)));
    }

    if let LinkMode::OneSide(study_side) = mode {
        if board.side_to_move() != study_side {
            // Not the studied side: follow the cached line only.
            let Some(pv_move) = record.first_pv_move() else {
                return Ok((Vec::new(), None));
            };
            let mv = ChessMove::from_str(pv_move).map_err(|e| {
                GraphSearchError::InvalidPosition(format!(
                    "cached pv move '{}' at {}: {}",
                    pv_move, record.key, e
                ))
            })?;
            if !board.legal(mv) {
                return Err(GraphSearchError::InvalidPosition(format!(
                    "cached pv move '{}' is illegal at {}",
                    pv_move, record.key
                )));
            }
            let target = position_key(&board.make_move_new(mv));
            if store.contains(&target) {
                return Ok((vec![(pv_move.to_string(), target)], None));
            }
            return Ok((Vec::new(), None));
        }
    }

    // Two-sided rule: all successors cached, or no edges at all.
    let mut edges = Vec::new();
    for mv in legal {
        let target = position_key(&board.make_move_new(mv));
        if !store.contains(&target) {
            return Ok((Vec::new(), None));
        }
        edges.push((mv.to_string(), target));
    }
    Ok((edges, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ScoreType;
    use chess::Board;

    fn record_for(key: &str, pv: Vec<String>) -> PositionRecord {
        PositionRecord {
            key: key.to_string(),
            start_fen: format!("{} 0 1", key),
            ply: 0,
            moves: vec![],
            depth: 10,
            seldepth: 12,
            score_type: ScoreType::Centipawn,
            score: 0,
            nodes: 1000,
            tbhits: 0,
            time_ms: 10,
            pv,
            source_id: 1,
        }
    }

    fn key_after(key: &str, mv: &str) -> PositionKey {
        let board = board_from_key(key).unwrap();
        let mv = ChessMove::from_str(mv).unwrap();
        position_key(&board.make_move_new(mv))
    }

    // White king a1, black king h8: exactly three legal moves for white.
    const THREE_MOVES: &str = "7k/8/8/8/8/8/8/K7 w - -";

    #[test]
    fn test_all_or_nothing_edges() {
        let board = board_from_key(THREE_MOVES).unwrap();
        let moves: Vec<ChessMove> = MoveGen::new_legal(&board).collect();
        assert_eq!(moves.len(), 3);

        let mut store = PositionStore::empty();
        store.insert_unsynced(record_for(THREE_MOVES, vec![]));

        // Only two of three successors cached: zero edges for the position.
        for mv in &moves[..2] {
            let target = position_key(&board.make_move_new(*mv));
            store.insert_unsynced(record_for(&target, vec![]));
        }
        let graph = LinkGraph::build(&store, LinkMode::TwoSided).unwrap();
        assert!(graph.successors(THREE_MOVES).is_none());
        assert_eq!(graph.edge_count(), 0);

        // Caching the third successor makes all three edges appear on the
        // next rebuild.
        let target = position_key(&board.make_move_new(moves[2]));
        store.insert_unsynced(record_for(&target, vec![]));
        let graph = LinkGraph::build(&store, LinkMode::TwoSided).unwrap();
        let successors = graph.successors(THREE_MOVES).unwrap();
        assert_eq!(successors.len(), 3);
        assert_eq!(graph.edge_count(), 3);
        for mv in &moves {
            let target = position_key(&board.make_move_new(*mv));
            assert_eq!(successors.get(&target).unwrap(), &mv.to_string());
        }
    }

    #[test]
    fn test_one_side_follows_cached_line() {
        // Black to move and black is not the studied side: a single edge
        // along the cached pv, even though other successors are uncached.
        let start = "7k/8/8/8/8/8/8/K7 b - -";
        let pv_target = key_after(start, "h8g7");

        let mut store = PositionStore::empty();
        store.insert_unsynced(record_for(start, vec!["h8g7".to_string()]));
        store.insert_unsynced(record_for(&pv_target, vec![]));

        let graph = LinkGraph::build(&store, LinkMode::OneSide(Color::White)).unwrap();
        let successors = graph.successors(start).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors.get(&pv_target).unwrap(), "h8g7");

        // The same store in two-sided mode has no edges: black has more
        // replies than the one that is cached.
        let graph = LinkGraph::build(&store, LinkMode::TwoSided).unwrap();
        assert!(graph.successors(start).is_none());
    }

    #[test]
    fn test_one_side_pv_target_must_be_cached() {
        let start = "7k/8/8/8/8/8/8/K7 b - -";
        let mut store = PositionStore::empty();
        store.insert_unsynced(record_for(start, vec!["h8g7".to_string()]));

        let graph = LinkGraph::build(&store, LinkMode::OneSide(Color::White)).unwrap();
        assert!(graph.successors(start).is_none());
    }

    #[test]
    fn test_terminal_positions_get_no_edges() {
        // Back-rank style queen mate and a classic queen stalemate.
        let mate = "k7/1Q6/1K6/8/8/8/8/8 b - -";
        let stalemate = "k7/8/1Q6/8/8/8/8/K7 b - -";

        let mut store = PositionStore::empty();
        store.insert_unsynced(record_for(mate, vec![]));
        store.insert_unsynced(record_for(stalemate, vec![]));

        let graph = LinkGraph::build(&store, LinkMode::TwoSided).unwrap();
        assert!(graph.successors(mate).is_none());
        assert!(graph.successors(stalemate).is_none());
        assert_eq!(graph.terminal(mate), Some(TerminalOutcome::Checkmate));
        assert_eq!(graph.terminal(stalemate), Some(TerminalOutcome::Stalemate));
        assert_eq!(graph.terminal(THREE_MOVES), None);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let board = Board::default();
        let start = position_key(&board);
        let mut store = PositionStore::empty();
        store.insert_unsynced(record_for(&start, vec![]));
        for mv in MoveGen::new_legal(&board) {
            let target = position_key(&board.make_move_new(mv));
            store.insert_unsynced(record_for(&target, vec![]));
        }

        let first = LinkGraph::build(&store, LinkMode::TwoSided).unwrap();
        let second = LinkGraph::build(&store, LinkMode::TwoSided).unwrap();
        assert_eq!(first.edge_count(), 20);
        assert_eq!(second.edge_count(), 20);
        assert_eq!(
            first.successors(&start).unwrap(),
            second.successors(&start).unwrap()
        );
    }

    #[test]
    fn test_add_edge_counts_unique_edges() {
        let mut graph = LinkGraph::new(LinkMode::TwoSided);
        graph.add_edge("a", "b", "m1");
        graph.add_edge("a", "b", "m1");
        graph.add_edge("a", "c", "m2");
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.linked_position_count(), 1);
    }
}
