//! Append-only journal of decision-state changes.
//!
//! Every record carries enough payload to rebuild the decision state on a
//! warm restart. Two backends: a buffered JSON-lines file and a null sink.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use premia_core::{OptionSide, Price, Qty, Symbol, SwingKind};
use premia_risk::SessionSummary;

/// Journal failures surface on the next engine cycle; they never block the
/// decision path.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type JournalResult<T> = Result<T, JournalError>;

/// Everything the engine journals, tagged for downstream consumers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    SwingConfirmed {
        symbol: Symbol,
        kind: SwingKind,
        price: Price,
        vwap_at_formation: Price,
    },
    SwingUpdated {
        symbol: Symbol,
        kind: SwingKind,
        price: Price,
    },
    SwingBroken {
        symbol: Symbol,
        kind: SwingKind,
        price: Price,
        breaking_price: Price,
    },
    CandidateGated {
        symbol: Symbol,
        side: OptionSide,
        entry_price: Price,
        vwap_at_formation: Price,
    },
    CandidateDisqualified {
        symbol: Symbol,
        reason: String,
    },
    OrderPlaced {
        symbol: Symbol,
        side: OptionSide,
        order_id: String,
        limit_price: Price,
        quantity: Qty,
    },
    OrderModified {
        symbol: Symbol,
        order_id: String,
        limit_price: Price,
    },
    OrderCancelled {
        symbol: Symbol,
        order_id: String,
        reason: String,
    },
    OrderFilled {
        symbol: Symbol,
        order_id: String,
        price: Price,
        quantity: Qty,
    },
    PositionOpened {
        symbol: Symbol,
        side: OptionSide,
        quantity: Qty,
        entry_price: Price,
        stop_trigger: Price,
    },
    PositionClosed {
        symbol: Symbol,
        side: OptionSide,
        quantity: Qty,
        entry_price: Price,
        exit_price: Price,
        r_multiple: Decimal,
        reason: String,
    },
    RiskHalt {
        reason: String,
        session_r: Decimal,
    },
    SessionSummary {
        summary: SessionSummary,
    },
}

/// One journal line.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JournalRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JournalEvent,
}

/// Sink for journal records.
pub trait Journal: Send + Sync {
    fn append(&self, event: JournalEvent) -> JournalResult<()>;
    fn flush(&self) -> JournalResult<()>;
}

/// Discards everything.
#[derive(Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn append(&self, _event: JournalEvent) -> JournalResult<()> {
        Ok(())
    }

    fn flush(&self) -> JournalResult<()> {
        Ok(())
    }
}

/// JSON-lines file journal, one record per line.
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back (tooling and warm-restart helpers).
    pub fn read_all(path: impl AsRef<Path>) -> JournalResult<Vec<JournalRecord>> {
        let raw = std::fs::read_to_string(path)?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(JournalError::from))
            .collect()
    }
}

impl Journal for FileJournal {
    fn append(&self, event: JournalEvent) -> JournalResult<()> {
        let record = JournalRecord {
            ts: Utc::now(),
            event,
        };
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().expect("journal writer lock");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> JournalResult<()> {
        self.writer.lock().expect("journal writer lock").flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<JournalEvent> {
        vec![
            JournalEvent::SwingConfirmed {
                symbol: "NIFTY06FEB2624200CE".into(),
                kind: SwingKind::Low,
                price: Decimal::from(130),
                vwap_at_formation: Decimal::from(124),
            },
            JournalEvent::OrderPlaced {
                symbol: "NIFTY06FEB2624200CE".into(),
                side: OptionSide::Ce,
                order_id: "ord-1".into(),
                limit_price: Decimal::new(12_995, 2),
                quantity: 585,
            },
            JournalEvent::RiskHalt {
                reason: "daily target reached".into(),
                session_r: Decimal::new(51, 1),
            },
        ]
    }

    #[test]
    fn file_journal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = FileJournal::open(&path).unwrap();
        for event in sample_events() {
            journal.append(event).unwrap();
        }
        journal.flush().unwrap();

        let records = FileJournal::read_all(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].event, sample_events()[0]);
        assert_eq!(records[2].event, sample_events()[2]);
    }

    #[test]
    fn records_are_tagged_snake_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = FileJournal::open(&path).unwrap();
        journal
            .append(JournalEvent::SessionSummary {
                summary: SessionSummary::default(),
            })
            .unwrap();
        journal.flush().unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains(r#""event":"session_summary""#));
    }

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.append(sample_events().remove(0)).unwrap();
            journal.flush().unwrap();
        }
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.append(sample_events().remove(1)).unwrap();
            journal.flush().unwrap();
        }
        assert_eq!(FileJournal::read_all(&path).unwrap().len(), 2);
    }
}
