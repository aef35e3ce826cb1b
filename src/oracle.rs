use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crate::errors::{GraphSearchError, Result};
use crate::record::ScoreType;

/// Engines never report a depth beyond this; reaching it ends an
/// infinite-mode analysis.
pub const DEPTH_CEILING: u32 = 127;

/// One completed oracle evaluation, straight from the engine's final
/// `info` state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAnalysis {
    pub depth: u32,
    pub seldepth: u32,
    pub score_type: ScoreType,
    /// Centipawns or moves-to-mate, from the mover's perspective.
    pub score: i32,
    pub nodes: u64,
    pub tbhits: u64,
    pub time_ms: u64,
    pub pv: Vec<String>,
}

/// How long the oracle is allowed to think about one position.
#[derive(Debug, Clone, Copy)]
pub enum AnalysisBudget {
    /// `go infinite`, stopped once the reported node count passes the
    /// budget (or a mate / the depth ceiling shows up earlier).
    Nodes(u64),
    /// `go movetime`, with the same early-stop conditions.
    MoveTimeMs(u64),
}

/// Blocking position evaluator. One request outstanding at a time: the
/// call does not return until the engine has produced a final result, and
/// no other core logic runs in the meantime.
pub trait Oracle {
    /// Evaluate the position reached by playing `moves` from `start_fen`.
    fn evaluate(
        &mut self,
        start_fen: &str,
        moves: &[String],
        budget: AnalysisBudget,
    ) -> Result<EngineAnalysis>;

    /// Identifier recorded as the `source_id` of records this oracle
    /// produces.
    fn source_id(&self) -> i64;
}

/// Configuration for a child-process UCI engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UciOracleConfig {
    pub engine_path: String,
    pub hash_mb: u32,
    pub syzygy_path: Option<String>,
    pub source_id: i64,
}

impl Default for UciOracleConfig {
    fn default() -> Self {
        Self {
            engine_path: "stockfish".to_string(),
            hash_mb: 1024,
            syzygy_path: None,
            source_id: 1,
        }
    }
}

/// UCI engine wrapper speaking the protocol over piped stdio.
///
/// Both oracle roles (full-search scorer and principal-variation-only
/// engine) are instances of this one type pointed at different binaries;
/// the caller picks which instance to ask.
pub struct UciOracle {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    config: UciOracleConfig,
}

impl UciOracle {
    pub fn launch(config: UciOracleConfig) -> Result<Self> {
        let mut process = Command::new(&config.engine_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                GraphSearchError::OracleError(format!(
                    "failed to start '{}': {}",
                    config.engine_path, e
                ))
            })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| GraphSearchError::OracleError("failed to get stdin".to_string()))?;
        let stdout = BufReader::new(
            process
                .stdout
                .take()
                .ok_or_else(|| GraphSearchError::OracleError("failed to get stdout".to_string()))?,
        );

        let mut oracle = Self {
            process,
            stdin,
            stdout,
            config,
        };
        oracle.initialize()?;
        Ok(oracle)
    }

    fn initialize(&mut self) -> Result<()> {
        self.send_command("uci")?;
        loop {
            let response = self.read_response()?;
            if response.contains("uciok") {
                break;
            }
        }

        let hash = self.config.hash_mb;
        self.send_command(&format!("setoption name Hash value {}", hash))?;
        if let Some(syzygy) = self.config.syzygy_path.clone() {
            self.send_command(&format!("setoption name SyzygyPath value {}", syzygy))?;
        }

        self.send_command("isready")?;
        loop {
            let response = self.read_response()?;
            if response.contains("readyok") {
                break;
            }
        }
        Ok(())
    }

    fn send_command(&mut self, command: &str) -> Result<()> {
        writeln!(self.stdin, "{}", command)
            .map_err(|e| GraphSearchError::OracleError(format!("send failed: {}", e)))?;
        self.stdin
            .flush()
            .map_err(|e| GraphSearchError::OracleError(format!("flush failed: {}", e)))?;
        Ok(())
    }

    fn read_response(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| GraphSearchError::OracleError(format!("read failed: {}", e)))?;
        if read == 0 {
            return Err(GraphSearchError::OracleError(
                "engine closed its output stream".to_string(),
            ));
        }
        Ok(line.trim().to_string())
    }
}

impl Oracle for UciOracle {
    fn evaluate(
        &mut self,
        start_fen: &str,
        moves: &[String],
        budget: AnalysisBudget,
    ) -> Result<EngineAnalysis> {
        if moves.is_empty() {
            self.send_command(&format!("position fen {}", start_fen))?;
        } else {
            self.send_command(&format!(
                "position fen {} moves {}",
                start_fen,
                moves.join(" ")
            ))?;
        }

        match budget {
            AnalysisBudget::Nodes(_) => self.send_command("go infinite")?,
            AnalysisBudget::MoveTimeMs(ms) => self.send_command(&format!("go movetime {}", ms))?,
        }

        let mut snapshot: Option<EngineAnalysis> = None;
        let mut stop_sent = false;
        loop {
            let response = self.read_response()?;

            if response.starts_with("info") {
                if let Some(update) = parse_info_line(&response) {
                    let merged = merge_update(snapshot.take(), update);
                    let done = analysis_satisfies_budget(&merged, budget);
                    snapshot = Some(merged);
                    if done && !stop_sent {
                        self.send_command("stop")?;
                        stop_sent = true;
                    }
                }
            } else if response.starts_with("bestmove") {
                let mut analysis = snapshot.ok_or_else(|| {
                    GraphSearchError::OracleError(
                        "engine sent bestmove without any scored info line".to_string(),
                    )
                })?;
                if analysis.pv.is_empty() {
                    // No pv on any scored line: fall back to bestmove and
                    // the ponder move when present.
                    let parts: Vec<&str> = response.split_whitespace().collect();
                    if let Some(best) = parts.get(1).copied().filter(|m| *m != "(none)") {
                        analysis.pv.push(best.to_string());
                    }
                    if parts.get(2) == Some(&"ponder") {
                        if let Some(ponder) = parts.get(3) {
                            analysis.pv.push(ponder.to_string());
                        }
                    }
                }
                return Ok(analysis);
            }
        }
    }

    fn source_id(&self) -> i64 {
        self.config.source_id
    }
}

impl Drop for UciOracle {
    fn drop(&mut self) {
        let _ = self.send_command("quit");
        let _ = self.process.wait();
    }
}

/// Has the analysis hit its budget (or found something that makes more
/// searching pointless)?
fn analysis_satisfies_budget(analysis: &EngineAnalysis, budget: AnalysisBudget) -> bool {
    if analysis.score_type == ScoreType::Mate || analysis.depth >= DEPTH_CEILING {
        return true;
    }
    match budget {
        AnalysisBudget::Nodes(limit) => analysis.nodes > limit,
        AnalysisBudget::MoveTimeMs(_) => false,
    }
}

/// Fields parsed from one scored `info` line.
struct InfoUpdate {
    depth: Option<u32>,
    seldepth: Option<u32>,
    score_type: ScoreType,
    score: i32,
    nodes: Option<u64>,
    tbhits: Option<u64>,
    time_ms: Option<u64>,
    pv: Option<Vec<String>>,
}

/// Parse a UCI `info` line. Returns `None` for lines without a usable
/// score: no `score` token, a lowerbound/upperbound partial score, or a
/// secondary multipv line.
fn parse_info_line(line: &str) -> Option<InfoUpdate> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    let mut depth = None;
    let mut seldepth = None;
    let mut score: Option<(ScoreType, i32)> = None;
    let mut nodes = None;
    let mut tbhits = None;
    let mut time_ms = None;
    let mut pv = None;

    let mut i = 1;
    while i < tokens.len() {
        match tokens[i] {
            "depth" => {
                depth = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "seldepth" => {
                seldepth = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "multipv" => {
                if tokens.get(i + 1) != Some(&"1") {
                    return None;
                }
                i += 2;
            }
            "score" => {
                let kind = match tokens.get(i + 1) {
                    Some(&"cp") => ScoreType::Centipawn,
                    Some(&"mate") => ScoreType::Mate,
                    _ => return None,
                };
                let value: i32 = tokens.get(i + 2).and_then(|t| t.parse().ok())?;
                if matches!(tokens.get(i + 3), Some(&"lowerbound") | Some(&"upperbound")) {
                    return None;
                }
                score = Some((kind, value));
                i += 3;
            }
            "nodes" => {
                nodes = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "tbhits" => {
                tbhits = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "time" => {
                time_ms = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "pv" => {
                pv = Some(tokens[i + 1..].iter().map(|t| t.to_string()).collect());
                break;
            }
            _ => i += 1,
        }
    }

    let (score_type, score) = score?;
    Some(InfoUpdate {
        depth,
        seldepth,
        score_type,
        score,
        nodes,
        tbhits,
        time_ms,
        pv,
    })
}

/// Fold an update into the running snapshot, keeping the last value seen
/// for fields the new line omits.
fn merge_update(snapshot: Option<EngineAnalysis>, update: InfoUpdate) -> EngineAnalysis {
    let mut merged = snapshot.unwrap_or(EngineAnalysis {
        depth: 0,
        seldepth: 0,
        score_type: ScoreType::Centipawn,
        score: 0,
        nodes: 0,
        tbhits: 0,
        time_ms: 0,
        pv: Vec::new(),
    });
    merged.score_type = update.score_type;
    merged.score = update.score;
    if let Some(depth) = update.depth {
        merged.depth = depth;
    }
    if let Some(seldepth) = update.seldepth {
        merged.seldepth = seldepth;
    }
    if let Some(nodes) = update.nodes {
        merged.nodes = nodes;
    }
    if let Some(tbhits) = update.tbhits {
        merged.tbhits = tbhits;
    }
    if let Some(time_ms) = update.time_ms {
        merged.time_ms = time_ms;
    }
    if let Some(pv) = update.pv {
        merged.pv = pv;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_info_line() {
        let update = parse_info_line(
            "info depth 24 seldepth 31 multipv 1 score cp 28 nodes 8042816 nps 1534000 \
             tbhits 3 time 5243 pv e2e4 e7e5 g1f3",
        )
        .unwrap();
        assert_eq!(update.depth, Some(24));
        assert_eq!(update.seldepth, Some(31));
        assert_eq!(update.score_type, ScoreType::Centipawn);
        assert_eq!(update.score, 28);
        assert_eq!(update.nodes, Some(8_042_816));
        assert_eq!(update.tbhits, Some(3));
        assert_eq!(update.time_ms, Some(5243));
        assert_eq!(
            update.pv.unwrap(),
            vec!["e2e4".to_string(), "e7e5".to_string(), "g1f3".to_string()]
        );
    }

    #[test]
    fn test_parse_skips_unusable_lines() {
        // No score at all.
        assert!(parse_info_line("info depth 10 currmove e2e4 currmovenumber 1").is_none());
        // Aspiration-window partial scores.
        assert!(parse_info_line("info depth 20 score cp 31 lowerbound nodes 100").is_none());
        assert!(parse_info_line("info depth 20 score cp 12 upperbound nodes 100").is_none());
        // Secondary multipv lines.
        assert!(
            parse_info_line("info depth 20 multipv 2 score cp -4 pv d2d4").is_none()
        );
    }

    #[test]
    fn test_parse_mate_score() {
        let update = parse_info_line("info depth 31 score mate -6 nodes 120 pv h7h8").unwrap();
        assert_eq!(update.score_type, ScoreType::Mate);
        assert_eq!(update.score, -6);
    }

    #[test]
    fn test_merge_keeps_last_seen_fields() {
        let first = parse_info_line("info depth 10 score cp 15 nodes 1000 pv e2e4").unwrap();
        let merged = merge_update(None, first);
        assert_eq!(merged.depth, 10);
        assert_eq!(merged.pv, vec!["e2e4".to_string()]);

        // A later line without a pv keeps the previous one.
        let second = parse_info_line("info depth 12 score cp 20 nodes 5000").unwrap();
        let merged = merge_update(Some(merged), second);
        assert_eq!(merged.depth, 12);
        assert_eq!(merged.score, 20);
        assert_eq!(merged.nodes, 5000);
        assert_eq!(merged.pv, vec!["e2e4".to_string()]);
    }

    #[test]
    fn test_budget_break_rules() {
        let analysis = EngineAnalysis {
            depth: 20,
            seldepth: 25,
            score_type: ScoreType::Centipawn,
            score: 10,
            nodes: 400_000,
            tbhits: 0,
            time_ms: 900,
            pv: vec![],
        };
        assert!(!analysis_satisfies_budget(
            &analysis,
            AnalysisBudget::Nodes(1_000_000)
        ));
        assert!(analysis_satisfies_budget(
            &analysis,
            AnalysisBudget::Nodes(100_000)
        ));

        // A mate ends the analysis under any budget.
        let mate = EngineAnalysis {
            score_type: ScoreType::Mate,
            score: 4,
            ..analysis.clone()
        };
        assert!(analysis_satisfies_budget(&mate, AnalysisBudget::Nodes(u64::MAX)));
        assert!(analysis_satisfies_budget(&mate, AnalysisBudget::MoveTimeMs(5000)));

        let deep = EngineAnalysis {
            depth: DEPTH_CEILING,
            ..analysis
        };
        assert!(analysis_satisfies_budget(&deep, AnalysisBudget::Nodes(u64::MAX)));
    }
}
