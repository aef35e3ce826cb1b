use chess::{Board, BoardStatus, Color, MoveGen};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use crate::errors::{GraphSearchError, Result};
use crate::links::{LinkGraph, LinkMode};
use crate::oracle::{AnalysisBudget, EngineAnalysis, Oracle};
use crate::record::{position_key, replay_moves, PositionRecord, ScoreType};
use crate::search::{is_mate_score, DrawPolicy, GraphSearch, SearchOutcome};
use crate::store::{AnalysisDatabase, PositionStore};

/// Serializable side-to-move selector for run configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn color(self) -> Color {
        match self {
            Side::White => Color::White,
            Side::Black => Color::Black,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "white" | "w" => Ok(Side::White),
            "black" | "b" => Ok(Side::Black),
            other => Err(GraphSearchError::ConfigurationError(format!(
                "unknown side '{}', expected white or black",
                other
            ))),
        }
    }
}

/// Run configuration shared by the analysis binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub db_path: String,
    /// FEN of the fixed starting position the cache grows from.
    pub start_fen: String,
    /// When set, only this side's deviations are explored; the other side
    /// follows its cached line.
    pub study_side: Option<Side>,
    /// When set, repetitions score as a heavy loss for this side instead
    /// of zero.
    pub draw_lost_side: Option<Side>,
    /// Oracle thinking budget per position, in nodes. The hunt loop
    /// converts it to an equivalent movetime.
    pub node_budget: u64,
    /// Search over the prebuilt link graph (default) or over live legal
    /// moves re-checked against the store.
    pub use_links: bool,
    /// During a sweep, step one move along each record's cached line
    /// before expanding its replies.
    pub best_move_only: bool,
    /// Presence of this file requests a graceful stop, polled once per
    /// loop iteration.
    pub break_file: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            db_path: "chess.db".to_string(),
            start_fen: Board::default().to_string(),
            study_side: None,
            draw_lost_side: None,
            node_budget: 1_000_000,
            use_links: true,
            best_move_only: true,
            break_file: "break_search.flag".to_string(),
        }
    }
}

impl AnalyzerConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn draw_policy(&self) -> DrawPolicy {
        match self.draw_lost_side {
            Some(side) => DrawPolicy::BiasAgainst(side.color()),
            None => DrawPolicy::Symmetric,
        }
    }

    pub fn link_mode(&self) -> LinkMode {
        match self.study_side {
            Some(side) => LinkMode::OneSide(side.color()),
            None => LinkMode::TwoSided,
        }
    }

    fn hunt_budget(&self) -> AnalysisBudget {
        AnalysisBudget::MoveTimeMs((self.node_budget / 1000).max(1))
    }

    fn sweep_budget(&self) -> AnalysisBudget {
        AnalysisBudget::Nodes(self.node_budget)
    }

    /// Commit roughly every 10^8 oracle nodes worth of work.
    fn commit_interval(&self) -> u64 {
        (100_000_000 / self.node_budget.max(1)).max(1)
    }
}

/// How a hunt run ended.
#[derive(Debug, Clone)]
pub enum HuntOutcome {
    /// The search proved a forced mate; `line` is the searched line
    /// extended with the cached continuation at its end.
    MateFound { score: i32, line: Vec<String> },
    /// The cancellation sentinel appeared; everything analysed so far is
    /// committed.
    Cancelled { last: SearchOutcome },
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub examined: usize,
    pub new_positions: u64,
    pub new_mates: u64,
    pub below_limit: u64,
    pub already_cached: u64,
    pub already_mate: u64,
    pub cancelled: bool,
}

/// Drives search -> targeted deepening -> re-search cycles over the cache.
///
/// The analyzer is the store's only writer. The oracle is asked about one
/// position at a time and every returned record is committed before the
/// loop moves on, so a stop request never leaves a torn cache.
pub struct Analyzer {
    config: AnalyzerConfig,
    db: AnalysisDatabase,
    store: PositionStore,
    graph: LinkGraph,
    search: GraphSearch,
    scorer: Box<dyn Oracle>,
    /// Optional second engine asked for the true line at positions where
    /// the scorer's pv reflects the studied side's alpha-beta needs.
    pv_oracle: Option<Box<dyn Oracle>>,
    start_key: String,
    oracle_calls: u64,
}

impl Analyzer {
    pub fn new(
        config: AnalyzerConfig,
        scorer: Box<dyn Oracle>,
        pv_oracle: Option<Box<dyn Oracle>>,
    ) -> Result<Self> {
        let db = AnalysisDatabase::open(&config.db_path)?;
        Self::with_database(config, db, scorer, pv_oracle)
    }

    pub fn with_database(
        config: AnalyzerConfig,
        db: AnalysisDatabase,
        scorer: Box<dyn Oracle>,
        pv_oracle: Option<Box<dyn Oracle>>,
    ) -> Result<Self> {
        let board = Board::from_str(&config.start_fen)
            .map_err(|e| GraphSearchError::InvalidPosition(format!("start fen: {}", e)))?;
        let start_key = position_key(&board);

        let store = PositionStore::load(&db)?;
        let search = GraphSearch::new(
            config.draw_policy(),
            config.study_side.map(Side::color),
        );
        let mut analyzer = Self {
            graph: LinkGraph::new(config.link_mode()),
            config,
            db,
            store,
            search,
            scorer,
            pv_oracle,
            start_key,
            oracle_calls: 0,
        };
        analyzer.ensure_root()?;
        analyzer.rebuild_links()?;
        Ok(analyzer)
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn graph(&self) -> &LinkGraph {
        &self.graph
    }

    pub fn oracle_calls(&self) -> u64 {
        self.oracle_calls
    }

    /// Seed the cache with the starting position if it is not there yet,
    /// so every run has a ply-0 root to grow from.
    fn ensure_root(&mut self) -> Result<()> {
        if self.store.contains(&self.start_key) {
            return Ok(());
        }
        log::info!("seeding root position {}", self.start_key);
        let board = Board::from_str(&self.config.start_fen)
            .map_err(|e| GraphSearchError::InvalidPosition(e.to_string()))?;
        let record = self.analyse_position(&board, Vec::new(), 0)?;
        self.store.insert(record);
        self.store.commit(&self.db)?;
        Ok(())
    }

    fn rebuild_links(&mut self) -> Result<()> {
        if self.config.use_links {
            self.graph = LinkGraph::build(&self.store, self.config.link_mode())?;
        }
        Ok(())
    }

    /// One search over the current cache, without touching the oracle.
    pub fn best_line(&mut self) -> Result<SearchOutcome> {
        let t0 = Instant::now();
        let outcome = if self.config.use_links {
            let board = crate::record::board_from_key(&self.start_key)?;
            self.search
                .search(&self.graph, &self.store, &self.start_key, board.side_to_move())
        } else {
            let board = Board::from_str(&self.config.start_fen)
                .map_err(|e| GraphSearchError::InvalidPosition(e.to_string()))?;
            self.search.search_board(&self.store, &board)
        };
        log::info!(
            "{} ({} nodes / {} positions) {:.3}s {}",
            outcome.score,
            outcome.nodes,
            self.store.len(),
            t0.elapsed().as_secs_f64(),
            outcome.pv.join(" ")
        );
        Ok(outcome)
    }

    /// Repeat search -> deepen-along-the-line until the search proves a
    /// forced mate or the cancellation sentinel appears.
    pub fn hunt(&mut self) -> Result<HuntOutcome> {
        log::info!(
            "hunt started {} (budget {} nodes, {} cached positions)",
            Local::now().format("%Y-%m-%dT%H:%M:%S"),
            self.config.node_budget,
            self.store.len()
        );
        loop {
            let outcome = self.best_line()?;

            if is_mate_score(outcome.score) {
                let line = self.full_mating_line(&outcome)?;
                log::info!("mating line: {}", line.join(" "));
                return Ok(HuntOutcome::MateFound {
                    score: outcome.score,
                    line,
                });
            }

            if self.cancelled() {
                self.consume_break_flag();
                return Ok(HuntOutcome::Cancelled { last: outcome });
            }

            self.extend_line(&outcome.pv)?;
            self.store.commit(&self.db)?;
            self.rebuild_links()?;
        }
    }

    /// The searched line extended with the cached continuation of its
    /// final position.
    fn full_mating_line(&self, outcome: &SearchOutcome) -> Result<Vec<String>> {
        let end = replay_moves(&self.config.start_fen, &outcome.pv)?;
        let end_key = position_key(&end);
        let record = self.store.get(&end_key).ok_or_else(|| {
            GraphSearchError::StoreInconsistency(format!(
                "principal variation ends at uncached position {}",
                end_key
            ))
        })?;
        let mut line = outcome.pv.clone();
        line.extend(record.pv.iter().cloned());
        Ok(line)
    }

    /// Ask the oracle about every position one move beyond the end of the
    /// given line (or just the cached-line reply, for the non-studied
    /// side), inserting the results and their edges.
    fn extend_line(&mut self, line: &[String]) -> Result<()> {
        let board = replay_moves(&self.config.start_fen, line)?;
        let key = position_key(&board);
        let record = self
            .store
            .get(&key)
            .ok_or_else(|| {
                GraphSearchError::StoreInconsistency(format!(
                    "line to extend ends at uncached position {}",
                    key
                ))
            })?
            .clone();

        let not_studied_side = self
            .config
            .study_side
            .map(|side| board.side_to_move() != side.color())
            .unwrap_or(false);
        if not_studied_side {
            self.analyse_pv_reply(&board, &record)
        } else {
            self.analyse_all_replies(&board, &record)
        }
    }

    /// Evaluate the position after every legal move.
    fn analyse_all_replies(&mut self, board: &Board, parent: &PositionRecord) -> Result<()> {
        let parent_key = position_key(board);
        for mv in MoveGen::new_legal(board) {
            let next = board.make_move_new(mv);
            let mut moves = parent.moves.clone();
            moves.push(mv.to_string());
            let record = self.analyse_position(&next, moves, parent.ply + 1)?;
            self.graph.add_edge(&parent_key, &record.key, &mv.to_string());
            self.store.insert(record);
        }
        Ok(())
    }

    /// Evaluate only the position after the parent's cached-line move.
    fn analyse_pv_reply(&mut self, board: &Board, parent: &PositionRecord) -> Result<()> {
        let Some(pv_move) = parent.first_pv_move() else {
            log::warn!("no cached line to follow at {}", parent.key);
            return Ok(());
        };
        let mv = chess::ChessMove::from_str(pv_move).map_err(|e| {
            GraphSearchError::InvalidPosition(format!(
                "cached pv move '{}' at {}: {}",
                pv_move, parent.key, e
            ))
        })?;
        if !board.legal(mv) {
            return Err(GraphSearchError::InvalidPosition(format!(
                "cached pv move '{}' is illegal at {}",
                pv_move, parent.key
            )));
        }
        let parent_key = position_key(board);
        let next = board.make_move_new(mv);
        let mut moves = parent.moves.clone();
        moves.push(pv_move.to_string());
        let record = self.analyse_position(&next, moves, parent.ply + 1)?;
        self.graph.add_edge(&parent_key, &record.key, pv_move);
        self.store.insert(record);
        Ok(())
    }

    /// One blocking oracle call, turned into a record ready for insertion.
    /// On oracle failure nothing is stored: the position stays absent and
    /// the search horizon simply does not extend there.
    fn analyse_position(
        &mut self,
        board: &Board,
        moves: Vec<String>,
        ply: u32,
    ) -> Result<PositionRecord> {
        self.oracle_calls += 1;
        let budget = self.config.hunt_budget();
        let mut analysis = self
            .scorer
            .evaluate(&self.config.start_fen, &moves, budget)?;

        // The scorer's line at a non-studied-side position reflects the
        // studied side's needs; ask the line engine for the true reply.
        let not_studied_side = self
            .config
            .study_side
            .map(|side| board.side_to_move() != side.color())
            .unwrap_or(false);
        if not_studied_side {
            if let Some(pv_oracle) = self.pv_oracle.as_mut() {
                let line = pv_oracle.evaluate(&self.config.start_fen, &moves, budget)?;
                log::debug!("line engine pv: {}", line.pv.join(" "));
                analysis.pv = line.pv;
            }
        }

        Ok(self.record_from_analysis(board, moves, ply, analysis))
    }

    fn record_from_analysis(
        &self,
        board: &Board,
        moves: Vec<String>,
        ply: u32,
        analysis: EngineAnalysis,
    ) -> PositionRecord {
        PositionRecord {
            key: position_key(board),
            start_fen: self.config.start_fen.clone(),
            ply,
            moves,
            depth: analysis.depth,
            seldepth: analysis.seldepth,
            score_type: analysis.score_type,
            score: analysis.score,
            nodes: analysis.nodes,
            tbhits: analysis.tbhits,
            time_ms: analysis.time_ms,
            pv: analysis.pv,
            source_id: self.scorer.source_id(),
        }
    }

    /// Breadth pass: expand every centipawn record at `ply` by one ply,
    /// evaluating replies that are not cached yet.
    pub fn sweep(&mut self, ply: u32, cp_limit: Option<i32>) -> Result<SweepReport> {
        let rows = self.db.records_at_ply(ply, cp_limit)?;
        let mut report = SweepReport {
            examined: rows.len(),
            ..SweepReport::default()
        };
        log::info!(
            "sweep of {} records at ply {} started {}",
            rows.len(),
            ply,
            Local::now().format("%Y-%m-%dT%H:%M:%S")
        );

        let progress = ProgressBar::new(rows.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let commit_interval = self.config.commit_interval();
        'rows: for row in rows {
            progress.inc(1);
            if self.cancelled() {
                report.cancelled = true;
                break;
            }

            let mut board = replay_moves(&row.start_fen, &row.moves)?;
            let mut moves = row.moves.clone();
            if self.config.best_move_only {
                // Step one move down the record's own line first, so the
                // sweep widens the tree where the oracle expects play to go.
                let Some(pv_move) = row.first_pv_move() else {
                    continue;
                };
                let Ok(mv) = chess::ChessMove::from_str(pv_move) else {
                    log::warn!("unreadable cached pv move '{}' at {}", pv_move, row.key);
                    continue;
                };
                if !board.legal(mv) {
                    log::warn!("illegal cached pv move '{}' at {}", pv_move, row.key);
                    continue;
                }
                board = board.make_move_new(mv);
                moves.push(pv_move.to_string());
            }
            if board.status() != BoardStatus::Ongoing {
                log::warn!("game already over after {}", moves.join(" "));
                continue;
            }

            for mv in MoveGen::new_legal(&board) {
                let next = board.make_move_new(mv);
                let key = position_key(&next);
                if let Some(existing) = self.store.get(&key) {
                    if existing.score_type == ScoreType::Mate {
                        report.already_mate += 1;
                    } else {
                        report.already_cached += 1;
                    }
                    continue;
                }

                self.oracle_calls += 1;
                let mut child_moves = moves.clone();
                child_moves.push(mv.to_string());
                let analysis = self.scorer.evaluate(
                    &row.start_fen,
                    &child_moves,
                    self.config.sweep_budget(),
                )?;
                progress.set_message(format!(
                    "+{} (-{}-M{})M{}",
                    report.new_positions,
                    report.already_cached,
                    report.already_mate,
                    report.new_mates
                ));

                if analysis.score_type == ScoreType::Mate {
                    report.new_mates += 1;
                } else {
                    report.new_positions += 1;
                    if cp_limit.is_some_and(|limit| analysis.score < limit) {
                        report.below_limit += 1;
                    }
                }
                let record =
                    self.record_from_analysis(&next, child_moves, row.ply + 1, analysis);
                self.store.insert(record);

                if (report.new_mates + report.new_positions) % commit_interval == 0 {
                    log::info!("committing {} records...", self.store.pending_count());
                    self.store.commit(&self.db)?;
                }
                if self.cancelled() {
                    report.cancelled = true;
                    break 'rows;
                }
            }
        }
        progress.finish_and_clear();

        self.store.commit(&self.db)?;
        if report.cancelled {
            self.consume_break_flag();
        }
        self.rebuild_links()?;
        log::info!(
            "new: {} (mates: {}), already: {}, already mate: {}",
            report.new_positions,
            report.new_mates,
            report.already_cached,
            report.already_mate
        );
        Ok(report)
    }

    fn cancelled(&self) -> bool {
        Path::new(&self.config.break_file).exists()
    }

    fn consume_break_flag(&self) {
        if let Err(e) = fs::remove_file(&self.config.break_file) {
            log::warn!("could not remove {}: {}", self.config.break_file, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::board_from_key;
    use std::collections::HashMap;

    /// Scripted oracle: canned analyses by position key, with a flat
    /// default for anything unscripted.
    struct FakeOracle {
        scripted: HashMap<String, (ScoreType, i32, Vec<String>)>,
        calls: u64,
    }

    impl FakeOracle {
        fn new() -> Self {
            Self {
                scripted: HashMap::new(),
                calls: 0,
            }
        }

        fn script(&mut self, key: &str, score_type: ScoreType, score: i32, pv: &[&str]) {
            self.scripted.insert(
                key.to_string(),
                (score_type, score, pv.iter().map(|s| s.to_string()).collect()),
            );
        }
    }

    impl Oracle for FakeOracle {
        fn evaluate(
            &mut self,
            start_fen: &str,
            moves: &[String],
            _budget: AnalysisBudget,
        ) -> crate::errors::Result<EngineAnalysis> {
            self.calls += 1;
            let board = replay_moves(start_fen, moves)?;
            let key = position_key(&board);
            let (score_type, score, pv) = self
                .scripted
                .get(&key)
                .cloned()
                .unwrap_or((ScoreType::Centipawn, 0, vec![]));
            Ok(EngineAnalysis {
                depth: 10,
                seldepth: 12,
                score_type,
                score,
                nodes: 1000,
                tbhits: 0,
                time_ms: 5,
                pv,
            })
        }

        fn source_id(&self) -> i64 {
            7
        }
    }

    // Black king h8 in check from the h1 rook: exactly two legal replies.
    const ROOK_CHECK: &str = "7k/8/8/8/8/8/8/1K5R b - - 0 1";

    fn config_for(break_file: &str) -> AnalyzerConfig {
        AnalyzerConfig {
            start_fen: ROOK_CHECK.to_string(),
            break_file: break_file.to_string(),
            ..AnalyzerConfig::default()
        }
    }

    fn key_after(moves: &[&str]) -> String {
        let moves: Vec<String> = moves.iter().map(|s| s.to_string()).collect();
        position_key(&replay_moves(ROOK_CHECK, &moves).unwrap())
    }

    #[test]
    fn test_hunt_terminates_on_forced_mate() {
        let mut oracle = FakeOracle::new();
        let root_key = position_key(&board_from_key(&key_after(&[])).unwrap());
        // Root looks level; both replies turn out to lose for black, one
        // faster than the other.
        oracle.script(&root_key, ScoreType::Centipawn, 0, &["h8g8"]);
        oracle.script(&key_after(&["h8g8"]), ScoreType::Mate, -1, &["h1h8"]);
        oracle.script(&key_after(&["h8g7"]), ScoreType::Mate, -2, &["h1h7", "g7g8"]);

        let db = AnalysisDatabase::in_memory().unwrap();
        let mut analyzer = Analyzer::with_database(
            config_for("no-such-flag.tmp"),
            db,
            Box::new(oracle),
            None,
        )
        .unwrap();

        // Iteration one: the root is a horizon leaf, so its replies get
        // analysed; iteration two proves the mate.
        let outcome = analyzer.hunt().unwrap();
        match outcome {
            HuntOutcome::MateFound { score, line } => {
                assert!(is_mate_score(score));
                assert!(score > 0);
                // Shorter mate preferred, cached continuation appended.
                assert_eq!(line, vec!["h8g8".to_string(), "h1h8".to_string()]);
            }
            other => panic!("expected a mate, got {:?}", other),
        }

        // Root plus both replies were committed.
        assert_eq!(analyzer.store().len(), 3);
    }

    #[test]
    fn test_hunt_honors_break_flag() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("break_search.flag");
        fs::write(&flag, b"").unwrap();

        let db = AnalysisDatabase::in_memory().unwrap();
        let mut analyzer = Analyzer::with_database(
            config_for(flag.to_str().unwrap()),
            db,
            Box::new(FakeOracle::new()),
            None,
        )
        .unwrap();

        let outcome = analyzer.hunt().unwrap();
        assert!(matches!(outcome, HuntOutcome::Cancelled { .. }));
        // The flag is consumed so the next run starts clean.
        assert!(!flag.exists());
    }

    #[test]
    fn test_sweep_expands_uncached_replies() {
        let db = AnalysisDatabase::in_memory().unwrap();
        let mut config = config_for("no-such-flag.tmp");
        config.best_move_only = false;
        let mut analyzer =
            Analyzer::with_database(config, db, Box::new(FakeOracle::new()), None).unwrap();
        assert_eq!(analyzer.store().len(), 1);

        let report = analyzer.sweep(0, None).unwrap();
        assert_eq!(report.examined, 1);
        // Both legal replies to the rook check were new.
        assert_eq!(report.new_positions, 2);
        assert_eq!(report.already_cached, 0);
        assert!(!report.cancelled);
        assert_eq!(analyzer.store().len(), 3);

        // A second sweep finds everything cached and asks the oracle
        // nothing new.
        let calls_before = analyzer.oracle_calls();
        let report = analyzer.sweep(0, None).unwrap();
        assert_eq!(report.new_positions, 0);
        assert_eq!(report.already_cached, 2);
        assert_eq!(analyzer.oracle_calls(), calls_before);
    }

    #[test]
    fn test_one_side_extension_follows_cached_line() {
        let mut oracle = FakeOracle::new();
        let root_key = key_after(&[]);
        oracle.script(&root_key, ScoreType::Centipawn, 0, &["h8g8"]);

        let db = AnalysisDatabase::in_memory().unwrap();
        let mut config = config_for("no-such-flag.tmp");
        // Studying white: black positions follow their cached line only.
        config.study_side = Some(Side::White);
        let mut analyzer =
            Analyzer::with_database(config, db, Box::new(oracle), None).unwrap();

        // Root is a black-to-move position, so extending the empty line
        // analyses exactly one reply: the cached h8g8.
        analyzer.extend_line(&[]).unwrap();
        assert_eq!(analyzer.store().len(), 2);
        assert!(analyzer.store().contains(&key_after(&["h8g8"])));
        assert!(!analyzer.store().contains(&key_after(&["h8g7"])));
    }

    #[test]
    fn test_config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{"db_path": "mate.db", "study_side": "white", "node_budget": 50000}"#,
        )
        .unwrap();

        let config = AnalyzerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.db_path, "mate.db");
        assert_eq!(config.study_side, Some(Side::White));
        assert_eq!(config.node_budget, 50_000);
        // Unset fields keep their defaults.
        assert!(config.use_links);
        assert_eq!(config.break_file, "break_search.flag");
        assert_eq!(config.link_mode(), LinkMode::OneSide(Color::White));
        assert_eq!(
            config.draw_policy(),
            crate::search::DrawPolicy::Symmetric
        );
    }
}
