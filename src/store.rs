use rusqlite::{params, Connection, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::Result;
use crate::record::{PositionKey, PositionRecord, ScoreType};

/// Durable, append-only store of oracle evaluations.
///
/// One row per insert; the same key may appear many times and the latest
/// row wins on lookup. Rows are never updated or deleted.
pub struct AnalysisDatabase {
    conn: Connection,
}

impl AnalysisDatabase {
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqlResult<Self> {
        let conn = Connection::open(db_path)?;
        let db = AnalysisDatabase { conn };
        db.create_tables()?;
        Ok(db)
    }

    pub fn in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = AnalysisDatabase { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqlResult<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS analysis (
                pos TEXT NOT NULL,
                fen TEXT NOT NULL,
                ply INTEGER NOT NULL,
                moves TEXT NOT NULL,
                depth INTEGER NOT NULL,
                seldepth INTEGER NOT NULL,
                score_type TEXT NOT NULL,
                score INTEGER NOT NULL,
                nodes INTEGER NOT NULL,
                tbhits INTEGER NOT NULL,
                time INTEGER NOT NULL,
                pv TEXT NOT NULL,
                program_id INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS analysis_pos_index ON analysis (pos)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS analysis_ply_index ON analysis (ply)",
            [],
        )?;

        Ok(())
    }

    pub fn insert(&self, record: &PositionRecord) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO analysis (pos, fen, ply, moves, depth, seldepth, score_type, score,
                                   nodes, tbhits, time, pv, program_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.key,
                record.start_fen,
                record.ply,
                record.moves.join(" "),
                record.depth,
                record.seldepth,
                record.score_type.as_str(),
                record.score,
                record.nodes as i64,
                record.tbhits as i64,
                record.time_ms as i64,
                record.pv.join(" "),
                record.source_id,
            ],
        )?;
        Ok(())
    }

    /// Insert many records in a single transaction.
    pub fn insert_batch(&self, records: &[PositionRecord]) -> SqlResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO analysis (pos, fen, ply, moves, depth, seldepth, score_type, score,
                                       nodes, tbhits, time, pv, program_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;

            for record in records {
                stmt.execute(params![
                    record.key,
                    record.start_fen,
                    record.ply,
                    record.moves.join(" "),
                    record.depth,
                    record.seldepth,
                    record.score_type.as_str(),
                    record.score,
                    record.nodes as i64,
                    record.tbhits as i64,
                    record.time_ms as i64,
                    record.pv.join(" "),
                    record.source_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn record_from_row(row: &Row<'_>) -> SqlResult<PositionRecord> {
        let moves: String = row.get(3)?;
        let score_type: String = row.get(6)?;
        let pv: String = row.get(11)?;

        Ok(PositionRecord {
            key: row.get(0)?,
            start_fen: row.get(1)?,
            ply: row.get(2)?,
            moves: moves.split_whitespace().map(str::to_string).collect(),
            depth: row.get(4)?,
            seldepth: row.get(5)?,
            score_type: ScoreType::parse(&score_type).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            score: row.get(7)?,
            nodes: row.get::<_, i64>(8)? as u64,
            tbhits: row.get::<_, i64>(9)? as u64,
            time_ms: row.get::<_, i64>(10)? as u64,
            pv: pv.split_whitespace().map(str::to_string).collect(),
            source_id: row.get(12)?,
        })
    }

    /// Latest record for a key, if any.
    pub fn get(&self, key: &str) -> SqlResult<Option<PositionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT pos, fen, ply, moves, depth, seldepth, score_type, score,
                    nodes, tbhits, time, pv, program_id
             FROM analysis WHERE pos = ?1 ORDER BY rowid DESC LIMIT 1",
        )?;

        let mut rows = stmt.query_map([key], Self::record_from_row)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// All records in insertion order. Duplicate keys are returned as-is;
    /// callers that want latest-wins semantics keep the last one seen.
    pub fn load_all(&self) -> SqlResult<Vec<PositionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT pos, fen, ply, moves, depth, seldepth, score_type, score,
                    nodes, tbhits, time, pv, program_id
             FROM analysis ORDER BY rowid",
        )?;

        let rows = stmt.query_map([], Self::record_from_row)?;
        rows.collect()
    }

    /// Centipawn-scored records at a given ply, optionally only those with a
    /// score below `cp_below`.
    pub fn records_at_ply(
        &self,
        ply: u32,
        cp_below: Option<i32>,
    ) -> SqlResult<Vec<PositionRecord>> {
        match cp_below {
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT pos, fen, ply, moves, depth, seldepth, score_type, score,
                            nodes, tbhits, time, pv, program_id
                     FROM analysis WHERE ply = ?1 AND score_type = 'cp' ORDER BY rowid",
                )?;
                let rows = stmt.query_map([ply], Self::record_from_row)?;
                rows.collect()
            }
            Some(limit) => {
                let mut stmt = self.conn.prepare(
                    "SELECT pos, fen, ply, moves, depth, seldepth, score_type, score,
                            nodes, tbhits, time, pv, program_id
                     FROM analysis
                     WHERE ply = ?1 AND score_type = 'cp' AND score < ?2 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![ply, limit], Self::record_from_row)?;
                rows.collect()
            }
        }
    }

    /// The ply-0 record the whole cache grows from, if the database is seeded.
    pub fn root(&self) -> SqlResult<Option<PositionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT pos, fen, ply, moves, depth, seldepth, score_type, score,
                    nodes, tbhits, time, pv, program_id
             FROM analysis WHERE ply = 0 ORDER BY rowid DESC LIMIT 1",
        )?;

        let mut rows = stmt.query_map([], Self::record_from_row)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    pub fn row_count(&self) -> SqlResult<i64> {
        let mut stmt = self.conn.prepare("SELECT COUNT(*) FROM analysis")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count)
    }
}

/// In-memory mirror of the durable store.
///
/// All reads during a search hit this map; writes land in the map at once
/// and accumulate in a pending list until [`PositionStore::commit`] flushes
/// them to the database in one transaction. The search engine only ever
/// reads; the orchestrator is the single writer.
pub struct PositionStore {
    records: HashMap<PositionKey, PositionRecord>,
    pending: Vec<PositionRecord>,
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::empty()
    }
}

impl PositionStore {
    pub fn empty() -> Self {
        Self {
            records: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Load the full database contents. Later rows supersede earlier rows
    /// under the same key.
    pub fn load(db: &AnalysisDatabase) -> Result<Self> {
        let mut records = HashMap::new();
        for record in db.load_all()? {
            records.insert(record.key.clone(), record);
        }
        Ok(Self {
            records,
            pending: Vec::new(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&PositionRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Insert a record, superseding any earlier one under the same key, and
    /// queue it for the next commit.
    pub fn insert(&mut self, record: PositionRecord) {
        self.pending.push(record.clone());
        self.records.insert(record.key.clone(), record);
    }

    /// Insert without queueing a database write. Used when building
    /// synthetic stores in tests and tools.
    pub fn insert_unsynced(&mut self, record: PositionRecord) {
        self.records.insert(record.key.clone(), record);
    }

    /// Flush pending records to the database in one transaction.
    pub fn commit(&mut self, db: &AnalysisDatabase) -> Result<usize> {
        let written = db.insert_batch(&self.pending)?;
        self.pending.clear();
        Ok(written)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PositionKey> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &PositionRecord> {
        self.records.values()
    }

    /// The ply-0 record, if present.
    pub fn root(&self) -> Option<&PositionRecord> {
        self.records.values().find(|r| r.ply == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(key: &str, ply: u32, score: i32) -> PositionRecord {
        PositionRecord {
            key: key.to_string(),
            start_fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
            ply,
            moves: vec![],
            depth: 20,
            seldepth: 28,
            score_type: ScoreType::Centipawn,
            score,
            nodes: 123_456,
            tbhits: 0,
            time_ms: 1500,
            pv: vec!["e2e4".to_string(), "e7e5".to_string()],
            source_id: 1,
        }
    }

    #[test]
    fn test_database_creation() {
        let db = AnalysisDatabase::in_memory().unwrap();
        assert_eq!(db.row_count().unwrap(), 0);
    }

    #[test]
    fn test_insert_and_get() {
        let db = AnalysisDatabase::in_memory().unwrap();
        let record = sample_record("k7/8/8/8/8/8/8/K7 w - -", 4, 35);
        db.insert(&record).unwrap();

        let loaded = db.get(&record.key).unwrap().unwrap();
        assert_eq!(loaded.key, record.key);
        assert_eq!(loaded.score, 35);
        assert_eq!(loaded.score_type, ScoreType::Centipawn);
        assert_eq!(loaded.pv, record.pv);
        assert_eq!(loaded.nodes, record.nodes);

        assert!(db.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_latest_wins() {
        let db = AnalysisDatabase::in_memory().unwrap();
        db.insert(&sample_record("k7/8/8/8/8/8/8/K7 w - -", 4, 35))
            .unwrap();
        db.insert(&sample_record("k7/8/8/8/8/8/8/K7 w - -", 4, -80))
            .unwrap();

        assert_eq!(db.row_count().unwrap(), 2);
        let loaded = db.get("k7/8/8/8/8/8/8/K7 w - -").unwrap().unwrap();
        assert_eq!(loaded.score, -80);

        // The mirror resolves duplicates the same way.
        let store = PositionStore::load(&db).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k7/8/8/8/8/8/8/K7 w - -").unwrap().score, -80);
    }

    #[test]
    fn test_records_at_ply_filter() {
        let db = AnalysisDatabase::in_memory().unwrap();
        db.insert(&sample_record("a w - -", 3, 10)).unwrap();
        db.insert(&sample_record("b w - -", 3, 90)).unwrap();
        db.insert(&sample_record("c w - -", 4, 10)).unwrap();
        let mut mated = sample_record("d w - -", 3, 5);
        mated.score_type = ScoreType::Mate;
        db.insert(&mated).unwrap();

        assert_eq!(db.records_at_ply(3, None).unwrap().len(), 2);
        let below = db.records_at_ply(3, Some(50)).unwrap();
        assert_eq!(below.len(), 1);
        assert_eq!(below[0].key, "a w - -");
    }

    #[test]
    fn test_commit_flushes_pending() {
        let db = AnalysisDatabase::in_memory().unwrap();
        let mut store = PositionStore::load(&db).unwrap();

        store.insert(sample_record("a w - -", 1, 12));
        store.insert(sample_record("b w - -", 1, -7));
        assert_eq!(store.pending_count(), 2);
        assert_eq!(db.row_count().unwrap(), 0);

        let written = store.commit(&db).unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(db.row_count().unwrap(), 2);

        // A second commit with nothing pending writes nothing.
        assert_eq!(store.commit(&db).unwrap(), 0);
    }

    #[test]
    fn test_on_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.db");

        {
            let db = AnalysisDatabase::open(&path).unwrap();
            db.insert(&sample_record("k7/8/8/8/8/8/8/K7 w - -", 0, 15))
                .unwrap();
        }

        let db = AnalysisDatabase::open(&path).unwrap();
        let root = db.root().unwrap().unwrap();
        assert_eq!(root.ply, 0);
        assert_eq!(root.score, 15);
    }
}
