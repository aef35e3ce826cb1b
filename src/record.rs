use chess::{Board, ChessMove};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::{GraphSearchError, Result};

/// Canonical position identity: the first four FEN fields (piece placement,
/// side to move, castling rights, en passant square). The move-clock fields
/// are stripped so that transpositions reached over different move counts
/// collapse onto one key.
pub type PositionKey = String;

/// How the oracle expressed a position's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreType {
    #[serde(rename = "cp")]
    Centipawn,
    #[serde(rename = "mate")]
    Mate,
}

impl ScoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreType::Centipawn => "cp",
            ScoreType::Mate => "mate",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cp" => Ok(ScoreType::Centipawn),
            "mate" => Ok(ScoreType::Mate),
            other => Err(GraphSearchError::DatabaseError(format!(
                "unknown score type '{}'",
                other
            ))),
        }
    }
}

/// One cached oracle evaluation of a position.
///
/// Records are append-only: once written they are never edited or deleted,
/// only superseded by a later insert under the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Canonical position identity (see [`position_key`]).
    pub key: PositionKey,
    /// FEN of the fixed starting position the whole cache grows from.
    pub start_fen: String,
    /// Half-moves from the starting position to this record.
    pub ply: u32,
    /// Moves (coordinate notation) from the starting position to here.
    pub moves: Vec<String>,
    /// Search depth reported by the oracle.
    pub depth: u32,
    /// Selective search depth reported by the oracle.
    pub seldepth: u32,
    pub score_type: ScoreType,
    /// Centipawns, or plies-to-mate when `score_type` is `Mate`, always from
    /// the perspective of the side to move (negative mate = mover is mated).
    pub score: i32,
    /// Oracle diagnostics, carried through unchanged.
    pub nodes: u64,
    pub tbhits: u64,
    pub time_ms: u64,
    /// Line the oracle considers best from this position.
    pub pv: Vec<String>,
    /// Which oracle instance produced this record.
    pub source_id: i64,
}

impl PositionRecord {
    /// Reconstruct the board for this record from its key.
    pub fn board(&self) -> Result<Board> {
        board_from_key(&self.key)
    }

    /// First move of the cached principal variation, if any.
    pub fn first_pv_move(&self) -> Option<&str> {
        self.pv.first().map(String::as_str)
    }
}

/// Derive the canonical key for a board.
pub fn position_key(board: &Board) -> PositionKey {
    let fen = board.to_string();
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

/// Derive the canonical key from a full FEN string.
pub fn key_from_fen(fen: &str) -> Result<PositionKey> {
    let board = Board::from_str(fen)?;
    Ok(position_key(&board))
}

/// Rebuild a board from a canonical key. The stripped move-clock fields are
/// irrelevant to play, so placeholder values are appended.
pub fn board_from_key(key: &str) -> Result<Board> {
    Board::from_str(&format!("{} 0 1", key)).map_err(|e| {
        GraphSearchError::InvalidPosition(format!("key '{}' is not a valid position: {}", key, e))
    })
}

/// Replay a move sequence from a starting FEN.
pub fn replay_moves(start_fen: &str, moves: &[String]) -> Result<Board> {
    let mut board = Board::from_str(start_fen)?;
    for mv in moves {
        let parsed = ChessMove::from_str(mv).map_err(|e| {
            GraphSearchError::InvalidPosition(format!("bad move '{}': {}", mv, e))
        })?;
        board = board.make_move_new(parsed);
    }
    Ok(board)
}
