//! Cell storage for tables.
//!
//! A [`CellStore`] holds table metadata plus one text value per `(row, col)`.
//! Every cell exists from the moment its table is created, initialised to the
//! empty string. Addresses are always structured values (table ID, row,
//! column) and are bound as statement parameters, never spliced into SQL.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ROWS: usize = 100;
pub const DEFAULT_COLS: usize = 26;
pub const DEFAULT_TITLE: &str = "Untitled";
pub const DEFAULT_WIDTH: u32 = 96;
pub const DEFAULT_HEIGHT: u32 = 32;

/// Table metadata. The override maps only affect presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub id: String,
    pub title: String,
    pub rows: usize,
    pub cols: usize,
    pub default_width: u32,
    pub width_changes: BTreeMap<usize, u32>,
    pub default_height: u32,
    pub height_changes: BTreeMap<usize, u32>,
}

impl TableConfig {
    /// A fresh `100 x 26` "Untitled" table.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            default_width: DEFAULT_WIDTH,
            width_changes: BTreeMap::new(),
            default_height: DEFAULT_HEIGHT,
            height_changes: BTreeMap::new(),
        }
    }

    pub fn with_extent(mut self, rows: usize, cols: usize) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn check_address(&self, row: usize, col: usize) -> Result<(), StoreError> {
        if row < self.rows && col < self.cols {
            Ok(())
        } else {
            Err(StoreError::address(row, col))
        }
    }

    /// Clips a half-open range to the table extent, returning `None` when
    /// nothing is left.
    fn clip(
        &self,
        from_row: usize,
        from_col: usize,
        to_row: usize,
        to_col: usize,
    ) -> Option<(usize, usize, usize, usize)> {
        let to_row = to_row.min(self.rows);
        let to_col = to_col.min(self.cols);
        (from_row < to_row && from_col < to_col).then_some((from_row, from_col, to_row, to_col))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cell ({row}, {col}) is out of bounds")]
    Address { row: i64, col: i64 },
    #[error("table {0:?} does not exist")]
    MissingTable(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn address(row: usize, col: usize) -> Self {
        StoreError::Address {
            row: i64::try_from(row).unwrap_or(i64::MAX),
            col: i64::try_from(col).unwrap_or(i64::MAX),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Read/write contract the coordinator relies on.
///
/// Implementations must be safe to share between coordinator tasks; each
/// table is still only ever touched by its own coordinator.
pub trait CellStore: Send + Sync {
    fn table_config(&self, id: &str) -> Result<Option<TableConfig>, StoreError>;

    /// Creates metadata and a grid of empty cells unless the table already
    /// exists. Returns whether creation happened.
    fn create_table(&self, config: &TableConfig) -> Result<bool, StoreError>;

    /// Rows `from_row..to_row` and columns `from_col..to_col` in ascending
    /// order. Parts of the range outside the table are simply absent.
    fn read_range(
        &self,
        id: &str,
        from_row: usize,
        from_col: usize,
        to_row: usize,
        to_col: usize,
    ) -> Result<Vec<Vec<String>>, StoreError>;

    fn write_cell(&self, id: &str, row: usize, col: usize, value: &str) -> Result<(), StoreError>;

    fn ensure_table(&self, id: &str, rows: usize, cols: usize) -> Result<bool, StoreError> {
        self.create_table(&TableConfig::new(id).with_extent(rows, cols))
    }

    /// Loads the table, creating it with defaults on first access.
    fn open_table(&self, id: &str) -> Result<TableConfig, StoreError> {
        if let Some(config) = self.table_config(id)? {
            return Ok(config);
        }
        let config = TableConfig::new(id);
        if self.create_table(&config)? {
            return Ok(config);
        }
        // Lost a creation race; the winner's metadata is authoritative.
        self.table_config(id)?
            .ok_or_else(|| StoreError::MissingTable(id.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
}

struct MemoryTable {
    config: TableConfig,
    cells: Vec<Vec<String>>,
}

/// Volatile store, handy for tests and `--database :memory:`.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CellStore for MemoryStore {
    fn table_config(&self, id: &str) -> Result<Option<TableConfig>, StoreError> {
        let tables = lock(&self.tables)?;
        Ok(tables.get(id).map(|table| table.config.clone()))
    }

    fn create_table(&self, config: &TableConfig) -> Result<bool, StoreError> {
        let mut tables = lock(&self.tables)?;
        if tables.contains_key(&config.id) {
            return Ok(false);
        }
        let cells = vec![vec![String::new(); config.cols]; config.rows];
        tables.insert(
            config.id.clone(),
            MemoryTable {
                config: config.clone(),
                cells,
            },
        );
        Ok(true)
    }

    fn read_range(
        &self,
        id: &str,
        from_row: usize,
        from_col: usize,
        to_row: usize,
        to_col: usize,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let tables = lock(&self.tables)?;
        let table = tables
            .get(id)
            .ok_or_else(|| StoreError::MissingTable(id.to_string()))?;

        let Some((from_row, from_col, to_row, to_col)) =
            table.config.clip(from_row, from_col, to_row, to_col)
        else {
            return Ok(Vec::new());
        };

        Ok(table.cells[from_row..to_row]
            .iter()
            .map(|row| row[from_col..to_col].to_vec())
            .collect())
    }

    fn write_cell(&self, id: &str, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables)?;
        let table = tables
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingTable(id.to_string()))?;
        table.config.check_address(row, col)?;
        table.cells[row][col] = value.to_string();
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sheets (
    id TEXT NOT NULL PRIMARY KEY,
    title TEXT NOT NULL,
    rows INTEGER NOT NULL,
    cols INTEGER NOT NULL,
    default_width INTEGER NOT NULL,
    width_changes TEXT NOT NULL,    -- JSON object: index -> width
    default_height INTEGER NOT NULL,
    height_changes TEXT NOT NULL    -- JSON object: index -> height
);

CREATE TABLE IF NOT EXISTS cells (
    sheet_id TEXT NOT NULL,
    row INTEGER NOT NULL,
    col INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (sheet_id, row, col)
) WITHOUT ROWID;
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store backed by a single SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn load_config(conn: &Connection, id: &str) -> Result<Option<TableConfig>, StoreError> {
    let row = conn
        .query_row(
            "SELECT title, rows, cols, default_width, width_changes, default_height, height_changes
             FROM sheets WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((title, rows, cols, default_width, width_changes, default_height, height_changes)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(TableConfig {
        id: id.to_string(),
        title,
        rows: to_index(rows)?,
        cols: to_index(cols)?,
        default_width: to_size(default_width)?,
        width_changes: serde_json::from_str(&width_changes)?,
        default_height: to_size(default_height)?,
        height_changes: serde_json::from_str(&height_changes)?,
    }))
}

fn to_index(value: i64) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::Storage(format!("corrupt index {value}")))
}

fn to_size(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Storage(format!("corrupt size {value}")))
}

fn to_sql(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Storage(format!("index {value} exceeds storage range")))
}

impl CellStore for SqliteStore {
    fn table_config(&self, id: &str) -> Result<Option<TableConfig>, StoreError> {
        let conn = lock(&self.conn)?;
        load_config(&conn, id)
    }

    fn create_table(&self, config: &TableConfig) -> Result<bool, StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO sheets
             (id, title, rows, cols, default_width, width_changes, default_height, height_changes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                config.id,
                config.title,
                to_sql(config.rows)?,
                to_sql(config.cols)?,
                config.default_width,
                serde_json::to_string(&config.width_changes)?,
                config.default_height,
                serde_json::to_string(&config.height_changes)?,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        {
            let mut stmt =
                tx.prepare("INSERT INTO cells (sheet_id, row, col, value) VALUES (?1, ?2, ?3, '')")?;
            for row in 0..to_sql(config.rows)? {
                for col in 0..to_sql(config.cols)? {
                    stmt.execute(params![config.id, row, col])?;
                }
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn read_range(
        &self,
        id: &str,
        from_row: usize,
        from_col: usize,
        to_row: usize,
        to_col: usize,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let conn = lock(&self.conn)?;
        let config =
            load_config(&conn, id)?.ok_or_else(|| StoreError::MissingTable(id.to_string()))?;

        let Some((from_row, from_col, to_row, to_col)) =
            config.clip(from_row, from_col, to_row, to_col)
        else {
            return Ok(Vec::new());
        };

        // Fixed-shape grid: the expected width is known before any row is read.
        let width = to_col - from_col;
        let mut grid = vec![vec![String::new(); width]; to_row - from_row];

        let mut stmt = conn.prepare(
            "SELECT row, col, value FROM cells
             WHERE sheet_id = ?1 AND row >= ?2 AND row < ?3 AND col >= ?4 AND col < ?5
             ORDER BY row, col",
        )?;
        let cells = stmt.query_map(
            params![
                id,
                to_sql(from_row)?,
                to_sql(to_row)?,
                to_sql(from_col)?,
                to_sql(to_col)?
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        for cell in cells {
            let (row, col, value) = cell?;
            let (row, col) = (to_index(row)?, to_index(col)?);
            grid[row - from_row][col - from_col] = value;
        }

        Ok(grid)
    }

    fn write_cell(&self, id: &str, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        let config =
            load_config(&conn, id)?.ok_or_else(|| StoreError::MissingTable(id.to_string()))?;
        config.check_address(row, col)?;

        conn.execute(
            "UPDATE cells SET value = ?4 WHERE sheet_id = ?1 AND row = ?2 AND col = ?3",
            params![id, to_sql(row)?, to_sql(col)?, value],
        )?;
        Ok(())
    }
}
