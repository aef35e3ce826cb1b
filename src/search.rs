use chess::{Board, BoardStatus, ChessMove, Color, MoveGen};
use std::collections::HashMap;
use std::str::FromStr;

use crate::links::{LinkGraph, TerminalOutcome};
use crate::record::{position_key, PositionKey, PositionRecord, ScoreType};
use crate::store::PositionStore;

/// Magnitude used to encode forced mates on the unified score scale.
pub const MATE_SCORE: i32 = 1_000_000;

/// Sentinel strictly below any real score; initial alpha and best-score
/// floor. Beta starts at `-WORST_SCORE`.
pub const WORST_SCORE: i32 = -10_000_000;

/// Magnitude of the asymmetric repetition score (see [`DrawPolicy`]).
pub const DRAW_BIAS: i32 = 10_000;

/// Sort-key discount that floats the previously-best move to the front of
/// the ascending move ordering.
const HISTORY_ORDERING_BONUS: i32 = 100;

/// Scores within this window of `MATE_SCORE` are mate distances and get
/// stepped by one ply as they propagate up the tree.
const MATE_WINDOW: i32 = 1_000;

/// Decode a cached record into the unified signed scale: centipawns map
/// directly, `mate in N` for the side to move maps near `+MATE_SCORE` and
/// being mated maps near `-MATE_SCORE`, with shorter mates larger in
/// magnitude.
pub fn unified_score(record: &PositionRecord) -> i32 {
    match record.score_type {
        ScoreType::Centipawn => record.score,
        ScoreType::Mate => {
            if record.score < 0 {
                -MATE_SCORE - record.score
            } else {
                MATE_SCORE - record.score
            }
        }
    }
}

/// Does a unified score encode a forced mate for either side?
pub fn is_mate_score(score: i32) -> bool {
    score.abs() + MATE_WINDOW > MATE_SCORE
}

/// How a repetition (or rules draw) is scored.
///
/// The asymmetric variant exists for endgames that the rules call drawn but
/// that are in truth lost for one side: scoring repetitions as a heavy loss
/// for that side steers the search away from shuffling lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPolicy {
    /// Draws score zero for both sides.
    Symmetric,
    /// Draws count as a large fixed loss for the given side and the same
    /// fixed gain for the other.
    BiasAgainst(Color),
}

impl DrawPolicy {
    /// Draw score from the perspective of the side to move.
    pub fn score(&self, to_move: Color) -> i32 {
        match self {
            DrawPolicy::Symmetric => 0,
            DrawPolicy::BiasAgainst(loser) => {
                if to_move == *loser {
                    -DRAW_BIAS
                } else {
                    DRAW_BIAS
                }
            }
        }
    }
}

/// Path-local traversal state: the current key, side to move, and how many
/// times each key occurs on the path from the search root. Incremented on
/// descent, decremented on backtrack; fresh for every top-level search so
/// concurrent what-if searches never interfere.
struct PathWalk {
    current: PositionKey,
    to_move: Color,
    visits: HashMap<PositionKey, u32>,
    stack: Vec<PositionKey>,
}

impl PathWalk {
    fn new(start: PositionKey, to_move: Color) -> Self {
        let mut visits = HashMap::new();
        visits.insert(start.clone(), 1);
        Self {
            current: start,
            to_move,
            visits,
            stack: Vec::new(),
        }
    }

    fn current(&self) -> &str {
        &self.current
    }

    fn to_move(&self) -> Color {
        self.to_move
    }

    fn visits(&self, key: &str) -> u32 {
        self.visits.get(key).copied().unwrap_or(0)
    }

    fn push(&mut self, next: &str) {
        let prev = std::mem::replace(&mut self.current, next.to_string());
        self.stack.push(prev);
        *self.visits.entry(next.to_string()).or_insert(0) += 1;
        self.to_move = !self.to_move;
    }

    fn pop(&mut self) {
        if let Some(count) = self.visits.get_mut(&self.current) {
            *count -= 1;
        }
        self.current = self.stack.pop().expect("pop past the search root");
        self.to_move = !self.to_move;
    }
}

/// Result of one top-level search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Unified score from the perspective of the side to move at the root.
    pub score: i32,
    /// Best line found, as coordinate-notation moves.
    pub pv: Vec<String>,
    /// Positions visited.
    pub nodes: u64,
}

/// Negamax/alpha-beta search over cached scores.
///
/// The engine never calls the oracle and never mutates the store: positions
/// outside the link graph (or with an uncached reply, in the non-linked
/// mode) are the search horizon and return their own cached score. The
/// traversal is a plain synchronous depth-first recursion; move ordering
/// and the shared alpha/beta window depend on it being sequential.
pub struct GraphSearch {
    draw_policy: DrawPolicy,
    /// In the non-linked mode, restricts the side whose deviations are
    /// explored; the other side follows its cached line.
    study_side: Option<Color>,
    /// Best move found the last time each position was searched. Ordering
    /// hint only, never correctness-affecting.
    history: HashMap<PositionKey, String>,
    nodes: u64,
}

impl GraphSearch {
    pub fn new(draw_policy: DrawPolicy, study_side: Option<Color>) -> Self {
        Self {
            draw_policy,
            study_side,
            history: HashMap::new(),
            nodes: 0,
        }
    }

    /// Best move recorded for a position by the most recent search of it.
    pub fn history_move(&self, key: &str) -> Option<&str> {
        self.history.get(key).map(String::as_str)
    }

    /// Full-window search over the link graph.
    pub fn search(
        &mut self,
        graph: &LinkGraph,
        store: &PositionStore,
        start_key: &str,
        to_move: Color,
    ) -> SearchOutcome {
        self.search_window(graph, store, start_key, to_move, WORST_SCORE, -WORST_SCORE)
    }

    pub fn search_window(
        &mut self,
        graph: &LinkGraph,
        store: &PositionStore,
        start_key: &str,
        to_move: Color,
        alpha: i32,
        beta: i32,
    ) -> SearchOutcome {
        self.nodes = 0;
        let mut walk = PathWalk::new(start_key.to_string(), to_move);
        let (score, pv) = self.visit(graph, store, &mut walk, alpha, beta);
        SearchOutcome {
            score,
            pv,
            nodes: self.nodes,
        }
    }

    /// Full-window search walking live legal moves instead of prebuilt
    /// links, re-checking every reply against the store.
    pub fn search_board(&mut self, store: &PositionStore, board: &Board) -> SearchOutcome {
        self.nodes = 0;
        let start = position_key(board);
        let mut walk = PathWalk::new(start, board.side_to_move());
        let (score, pv) = self.visit_board(store, board, &mut walk, WORST_SCORE, -WORST_SCORE);
        SearchOutcome {
            score,
            pv,
            nodes: self.nodes,
        }
    }

    fn visit(
        &mut self,
        graph: &LinkGraph,
        store: &PositionStore,
        walk: &mut PathWalk,
        mut alpha: i32,
        beta: i32,
    ) -> (i32, Vec<String>) {
        self.nodes += 1;
        let pos = walk.current().to_string();

        // Second occurrence on the current path: repetition, no recursion.
        if walk.visits(&pos) >= 2 {
            return (self.draw_policy.score(walk.to_move()), Vec::new());
        }

        if let Some(outcome) = graph.terminal(&pos) {
            return (self.terminal_score(outcome, walk.to_move()), Vec::new());
        }

        // No outgoing links: search horizon, fall back to the cached score.
        let Some(successors) = graph.successors(&pos) else {
            return (self.leaf_score(store, &pos), Vec::new());
        };

        let history_move = self.history.get(&pos).cloned();
        let mut ordered: Vec<(i32, String, PositionKey)> = successors
            .iter()
            .map(|(target, mv)| {
                let record = store.get(target).unwrap_or_else(|| {
                    panic!(
                        "link edge {} -> {} references a position missing from the store",
                        pos, target
                    )
                });
                let mut sort_key = unified_score(record);
                if history_move.as_deref() == Some(mv.as_str()) {
                    sort_key -= HISTORY_ORDERING_BONUS;
                }
                (sort_key, mv.clone(), target.clone())
            })
            .collect();
        if ordered.is_empty() {
            return (self.leaf_score(store, &pos), Vec::new());
        }

        // Ascending by the successor's own cached score: the child score is
        // from the opponent's perspective, so the smallest raw value is the
        // most promising move for us once negated.
        ordered.sort();

        let mut best_score = WORST_SCORE;
        let mut best_pv: Vec<String> = Vec::new();
        for (_, mv, target) in ordered {
            walk.push(&target);
            let (child_score, child_pv) = self.visit(graph, store, walk, -beta, -alpha);
            walk.pop();

            let score = step_mate_distance(-child_score);
            if score > best_score {
                best_score = score;
                best_pv = std::iter::once(mv).chain(child_pv).collect();
                if score >= alpha {
                    alpha = score;
                    if score >= beta {
                        break;
                    }
                }
            }
        }

        if let Some(first) = best_pv.first() {
            self.history.insert(pos, first.clone());
        }
        (best_score, best_pv)
    }

    fn visit_board(
        &mut self,
        store: &PositionStore,
        board: &Board,
        walk: &mut PathWalk,
        mut alpha: i32,
        beta: i32,
    ) -> (i32, Vec<String>) {
        self.nodes += 1;
        let pos = walk.current().to_string();

        if walk.visits(&pos) >= 2 {
            return (self.draw_policy.score(walk.to_move()), Vec::new());
        }

        match board.status() {
            BoardStatus::Checkmate => return (-MATE_SCORE, Vec::new()),
            BoardStatus::Stalemate => {
                return (self.draw_policy.score(walk.to_move()), Vec::new())
            }
            BoardStatus::Ongoing => {}
        }

        let own_record = store.get(&pos).unwrap_or_else(|| {
            panic!("searched position {} missing from the store", pos)
        });

        let mut candidates: Vec<(i32, String, Board, PositionKey)> = Vec::new();
        if self
            .study_side
            .map(|side| board.side_to_move() != side)
            .unwrap_or(false)
        {
            // Not the studied side: only its cached line is followed.
            let Some(pv_move) = own_record.first_pv_move() else {
                return (unified_score(own_record), Vec::new());
            };
            let Ok(mv) = ChessMove::from_str(pv_move) else {
                log::warn!("unreadable cached pv move '{}' at {}", pv_move, pos);
                return (unified_score(own_record), Vec::new());
            };
            if !board.legal(mv) {
                log::warn!("illegal cached pv move '{}' at {}", pv_move, pos);
                return (unified_score(own_record), Vec::new());
            }
            let next = board.make_move_new(mv);
            let target = position_key(&next);
            let Some(record) = store.get(&target) else {
                return (unified_score(own_record), Vec::new());
            };
            candidates.push((unified_score(record), pv_move.to_string(), next, target));
        } else {
            let history_move = self.history.get(&pos).cloned();
            for mv in MoveGen::new_legal(board) {
                let next = board.make_move_new(mv);
                let target = position_key(&next);
                // One uncached reply makes the whole position a horizon
                // leaf, exactly like the all-or-nothing link rule.
                let Some(record) = store.get(&target) else {
                    return (unified_score(own_record), Vec::new());
                };
                let mv_text = mv.to_string();
                let mut sort_key = unified_score(record);
                if history_move.as_deref() == Some(mv_text.as_str()) {
                    sort_key -= HISTORY_ORDERING_BONUS;
                }
                candidates.push((sort_key, mv_text, next, target));
            }
        }

        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut best_score = WORST_SCORE;
        let mut best_pv: Vec<String> = Vec::new();
        for (_, mv, next, target) in candidates {
            walk.push(&target);
            let (child_score, child_pv) = self.visit_board(store, &next, walk, -beta, -alpha);
            walk.pop();

            let score = step_mate_distance(-child_score);
            if score > best_score {
                best_score = score;
                best_pv = std::iter::once(mv).chain(child_pv).collect();
                if score >= alpha {
                    alpha = score;
                    if score >= beta {
                        break;
                    }
                }
            }
        }

        if let Some(first) = best_pv.first() {
            self.history.insert(pos, first.clone());
        }
        (best_score, best_pv)
    }

    fn terminal_score(&self, outcome: TerminalOutcome, to_move: Color) -> i32 {
        match outcome {
            TerminalOutcome::Checkmate => -MATE_SCORE,
            TerminalOutcome::Stalemate => self.draw_policy.score(to_move),
        }
    }

    fn leaf_score(&self, store: &PositionStore, pos: &str) -> i32 {
        let record = store.get(pos).unwrap_or_else(|| {
            panic!("searched position {} missing from the store", pos)
        });
        unified_score(record)
    }
}

/// Convert a just-negated child score into this node's score: mate
/// distances lose one ply of magnitude on the way up, so shorter mates
/// stay strictly preferable to longer ones.
fn step_mate_distance(score: i32) -> i32 {
    if is_mate_score(score) {
        score - score.signum()
    } else {
        score
    }
}
