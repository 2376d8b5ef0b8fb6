use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::CandleSink;
use crate::error::SinkError;
use crate::model::candle::Candle;

/// Local offline store. Rows are keyed by `(product_id, window_start_ms)`;
/// a correction for the same window overwrites the stored row.
///
/// Writes from [`CandleSink::accept`] run on tokio's blocking pool.
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ohlc_candles (
                product_id TEXT NOT NULL,
                window_start_ms INTEGER NOT NULL,
                window_end_ms INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                trades INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY(product_id, window_start_ms)
            );
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored candles of one instrument, oldest window first.
    pub fn load_candles(&self, product_id: &str) -> Result<Vec<Candle>, SinkError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT product_id, window_start_ms, window_end_ms,
                   open, high, low, close, volume, trades
            FROM ohlc_candles
            WHERE product_id = ?1
            ORDER BY window_start_ms ASC
            "#,
        )?;
        let rows = stmt.query_map(params![product_id], |row| {
            Ok(Candle {
                product_id: row.get(0)?,
                window_start_ms: row.get(1)?,
                window_end_ms: row.get(2)?,
                open: row.get(3)?,
                high: row.get(4)?,
                low: row.get(5)?,
                close: row.get(6)?,
                volume: row.get(7)?,
                trades: row.get::<_, i64>(8)?.max(0) as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, SinkError> {
    conn.lock()
        .map_err(|_| SinkError::Unavailable("sqlite connection lock poisoned".to_string()))
}

fn upsert_candle(conn: &Mutex<Connection>, candle: &Candle) -> Result<(), SinkError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    lock(conn)?.execute(
        r#"
        INSERT INTO ohlc_candles (
            product_id, window_start_ms, window_end_ms,
            open, high, low, close, volume, trades, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(product_id, window_start_ms) DO UPDATE SET
            window_end_ms = excluded.window_end_ms,
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            trades = excluded.trades,
            updated_at_ms = excluded.updated_at_ms
        "#,
        params![
            candle.product_id,
            candle.window_start_ms,
            candle.window_end_ms,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume,
            candle.trades as i64,
            now_ms,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl CandleSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn accept(&mut self, candle: &Candle) -> Result<(), SinkError> {
        let conn = Arc::clone(&self.conn);
        let candle = candle.clone();
        tokio::task::spawn_blocking(move || upsert_candle(&conn, &candle))
            .await
            .map_err(|e| SinkError::Unavailable(format!("sqlite write task failed: {}", e)))?
    }
}
