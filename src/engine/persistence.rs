//! Position Persistence (§6)
//!
//! A JSON journal of open positions, written atomically (write-to-temp,
//! then rename) after every open or close so the journal and the live book
//! never diverge even across a crash-restart (§4.3). In pure backtesting
//! there is no host broker to reconcile against, so reconciliation on
//! startup is a documented no-op (§4.3 Position persistence).

use crate::engine::position::Position;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedPositionBook {
    pub positions: Vec<Position>,
}

/// Write-to-temp-then-rename journal for the open position book.
pub struct PositionJournal {
    path: PathBuf,
}

impl PositionJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Atomically replace the journal with the current open book. Called
    /// after every `place_market_order` and `close_position` per §4.3's
    /// "must not diverge" requirement.
    pub fn write(&self, positions: &[Position]) -> std::io::Result<()> {
        let book = PersistedPositionBook {
            positions: positions.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&book)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp_path = self.tmp_path();
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn read(&self) -> std::io::Result<PersistedPositionBook> {
        if !self.path.exists() {
            return Ok(PersistedPositionBook::default());
        }
        let bytes = std::fs::read(&self.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        let file_name = tmp
            .file_name()
            .map(|n| format!("{}.tmp", n.to_string_lossy()))
            .unwrap_or_else(|| "positions.json.tmp".to_string());
        tmp.set_file_name(file_name);
        tmp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tick::Side;

    fn sample_position(ticket: u64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 0.10,
            open_price: 1.1001,
            open_time: 0,
            sl: 1.0990,
            tp: 1.1020,
            current_price: 1.1001,
            profit: 0.0,
            magic_number: 1,
            comment: "TB|buy".into(),
        }
    }

    #[test]
    fn round_trip_preserves_structural_equality() {
        let dir = tempfile::tempdir().unwrap();
        let journal = PositionJournal::new(dir.path().join("positions.json"));
        let positions = vec![sample_position(1), sample_position(2)];
        journal.write(&positions).unwrap();
        let reloaded = journal.read().unwrap();
        assert_eq!(reloaded.positions, positions);
    }

    #[test]
    fn missing_file_reads_as_empty_book() {
        let dir = tempfile::tempdir().unwrap();
        let journal = PositionJournal::new(dir.path().join("missing.json"));
        assert_eq!(journal.read().unwrap(), PersistedPositionBook::default());
    }

    #[test]
    fn write_is_atomic_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let journal = PositionJournal::new(dir.path().join("positions.json"));
        journal.write(&[sample_position(1)]).unwrap();
        assert!(!journal.tmp_path().exists());
        assert!(journal.path().exists());
    }
}
