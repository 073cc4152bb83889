use crate::fields;
use crate::record::{DataType, Record};
use crate::sink::SinkAdaptor;
use async_trait::async_trait;
use eyre::{eyre, Result};
use rusqlite::Connection;
use std::sync::Mutex;

/// Rows older than this are purged from the projection table on insert.
const PROJECTION_TTL_SECS: i64 = 86400;

/// Which table a store instance manages, selected by the configured name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableKind {
    /// `(id, payload)` rows holding serialized records whose delivery has
    /// not fully succeeded yet.
    Spool,
    /// Flat, indexed projection of 2K vehicle records for offline
    /// aggregation, with a 24-hour TTL.
    Projection,
}

/// Local durable store over SQLite. The driver is not safe for concurrent
/// writers, so every access is serialized by the mutex.
pub struct LocalStore {
    name: String,
    database: String,
    table: String,
    kind: TableKind,
    conn: Mutex<Option<Connection>>,
}

impl LocalStore {
    pub fn new(name: &str, database: &str, table: &str) -> Result<LocalStore> {
        let kind = match table {
            "failed_messages" => TableKind::Spool,
            "main_table" => TableKind::Projection,
            other => return Err(eyre!("unknown local table '{other}'")),
        };
        Ok(LocalStore {
            name: name.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            kind,
            conn: Mutex::new(None),
        })
    }

    pub fn open(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.is_some() {
            return Ok(());
        }
        let conn = Connection::open(&self.database)
            .map_err(|e| eyre!("sqlite open {} failed: {e}", self.database))?;
        match self.kind {
            TableKind::Spool => self.create_spool(&conn)?,
            TableKind::Projection => self.create_projection(&conn)?,
        }
        *guard = Some(conn);
        tracing::info!(database = %self.database, table = %self.table, "sqlite ready");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| eyre!("sqlite mutex poisoned"))
    }

    fn create_spool(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                   id INTEGER PRIMARY KEY AUTOINCREMENT,
                   payload TEXT NOT NULL
               );"#,
            table = self.table
        ))
        .map_err(|e| eyre!("spool table create failed: {e}"))
    }

    fn create_projection(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                   row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                   "{car_id}"          INTEGER,
                   "{turn_time}"       INTEGER,
                   "{stop_pass_time}"  INTEGER,
                   "{first_det_time}"  INTEGER,
                   "{vehicle_class}"   TEXT,
                   "{lane_no}"         INTEGER,
                   "{turn_type_cd}"    INTEGER,
                   "{turn_speed}"      REAL,
                   "{stop_pass_speed}" REAL,
                   "{interval_speed}"  REAL,
                   "{observe_time}"    INTEGER,
                   "{image_path}"      TEXT,
                   timestamp INTEGER DEFAULT (strftime('%s', 'now'))
               );
               CREATE INDEX IF NOT EXISTS idx_timestamp ON "{table}"(timestamp);
               CREATE INDEX IF NOT EXISTS idx_id        ON "{table}"("{car_id}");
               CREATE INDEX IF NOT EXISTS idx_dir_out   ON "{table}"("{turn_type_cd}");
               CREATE INDEX IF NOT EXISTS idx_lane      ON "{table}"("{lane_no}");
               CREATE INDEX IF NOT EXISTS idx_label     ON "{table}"("{vehicle_class}");

               CREATE TRIGGER IF NOT EXISTS cleanup_{table}
               AFTER INSERT ON "{table}"
               BEGIN
                   DELETE FROM "{table}"
                   WHERE timestamp < (strftime('%s','now') - {ttl});
               END;"#,
            table = self.table,
            car_id = fields::CAR_ID_2K,
            turn_time = fields::TURN_TIME,
            stop_pass_time = fields::STOP_PASS_TIME,
            first_det_time = fields::FIRST_DET_TIME,
            vehicle_class = fields::VEHICLE_CLASS,
            lane_no = fields::LANE_NO,
            turn_type_cd = fields::TURN_TYPE_CD,
            turn_speed = fields::TURN_SPEED,
            stop_pass_speed = fields::STOP_PASS_SPEED,
            interval_speed = fields::INTERVAL_SPEED,
            observe_time = fields::OBSERVE_TIME,
            image_path = fields::IMAGE_PATH_NAME,
            ttl = PROJECTION_TTL_SECS,
        ))
        .map_err(|e| eyre!("projection table create failed: {e}"))
    }

    /// Appends a record. Spool rows hold the full serialized map; projection
    /// rows hold the typed vehicle columns.
    pub fn insert_record(&self, record: &Record) -> Result<()> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(|| eyre!("sqlite not open"))?;
        match self.kind {
            TableKind::Spool => {
                let payload = record.to_json_string()?;
                conn.execute(
                    &format!(r#"INSERT INTO "{}" (payload) VALUES (?1);"#, self.table),
                    rusqlite::params![payload],
                )
                .map_err(|e| eyre!("spool insert failed: {e}"))?;
            }
            TableKind::Projection => {
                // Records spooled before camera discovery are unhashed, so
                // the original id may still live in car_id_2k.
                let car_id = record
                    .int(fields::OBJECT_ID)
                    .or_else(|| record.int(fields::CAR_ID_2K))
                    .ok_or_else(|| eyre!("projection row without a vehicle id"))?;
                conn.execute(
                    &format!(
                        r#"INSERT INTO "{table}" (
                               "{c1}", "{c2}", "{c3}", "{c4}", "{c5}", "{c6}",
                               "{c7}", "{c8}", "{c9}", "{c10}", "{c11}", "{c12}"
                           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);"#,
                        table = self.table,
                        c1 = fields::CAR_ID_2K,
                        c2 = fields::TURN_TIME,
                        c3 = fields::STOP_PASS_TIME,
                        c4 = fields::FIRST_DET_TIME,
                        c5 = fields::VEHICLE_CLASS,
                        c6 = fields::LANE_NO,
                        c7 = fields::TURN_TYPE_CD,
                        c8 = fields::TURN_SPEED,
                        c9 = fields::STOP_PASS_SPEED,
                        c10 = fields::INTERVAL_SPEED,
                        c11 = fields::OBSERVE_TIME,
                        c12 = fields::IMAGE_PATH_NAME,
                    ),
                    rusqlite::params![
                        car_id,
                        record.int(fields::TURN_TIME),
                        record.int(fields::STOP_PASS_TIME),
                        record.int(fields::FIRST_DET_TIME),
                        record.text(fields::VEHICLE_CLASS),
                        record.int(fields::LANE_NO),
                        record.int(fields::TURN_TYPE_CD),
                        record.float(fields::TURN_SPEED),
                        record.float(fields::STOP_PASS_SPEED),
                        record.float(fields::INTERVAL_SPEED),
                        record.int(fields::OBSERVE_TIME),
                        record.text(fields::IMAGE_PATH_NAME),
                    ],
                )
                .map_err(|e| eyre!("projection insert failed: {e}"))?;
            }
        }
        Ok(())
    }

    /// Returns the lowest-id spool row, if any.
    pub fn fetch_one(&self) -> Result<Option<(i64, String)>> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(|| eyre!("sqlite not open"))?;
        let mut stmt = conn
            .prepare(&format!(
                r#"SELECT id, payload FROM "{}" ORDER BY id ASC LIMIT 1;"#,
                self.table
            ))
            .map_err(|e| eyre!("spool fetch prepare failed: {e}"))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| eyre!("spool fetch failed: {e}"))?;
        match rows.next().map_err(|e| eyre!("spool fetch failed: {e}"))? {
            Some(row) => {
                let id: i64 = row.get(0).map_err(|e| eyre!("spool row id: {e}"))?;
                let payload: String = row.get(1).map_err(|e| eyre!("spool row payload: {e}"))?;
                Ok(Some((id, payload)))
            }
            None => Ok(None),
        }
    }

    pub fn delete_by_id(&self, id: i64) -> Result<()> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(|| eyre!("sqlite not open"))?;
        conn.execute(
            &format!(r#"DELETE FROM "{}" WHERE id = ?1;"#, self.table),
            rusqlite::params![id],
        )
        .map_err(|e| eyre!("spool delete failed: {e}"))?;
        Ok(())
    }
}

#[async_trait]
impl SinkAdaptor for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn endpoint(&self) -> String {
        format!("{}|{}", self.database, self.table)
    }

    async fn connect(&self) -> Result<()> {
        self.open()
    }

    async fn insert(&self, record: &Record, dtype: DataType) -> bool {
        match self.insert_record(record) {
            Ok(()) => {
                tracing::info!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    table = %self.table,
                    "sqlite insert success"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    table = %self.table,
                    error = %err,
                    "sqlite insert failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DataType;

    fn spool(dir: &tempfile::TempDir) -> LocalStore {
        let db = dir.path().join("spool.db");
        let store = LocalStore::new("SPOOL", db.to_str().unwrap(), "failed_messages").unwrap();
        store.open().unwrap();
        store
    }

    fn vehicle() -> Record {
        let mut record = Record::with_type(DataType::Vehicle2k);
        record.set(fields::CAR_ID_2K, "777");
        record.set(fields::TURN_TIME, 1700000000i64);
        record.set(fields::STOP_PASS_TIME, 1700000002i64);
        record.set(fields::FIRST_DET_TIME, 1699999999i64);
        record.set(fields::VEHICLE_CLASS, "PCAR");
        record.set(fields::LANE_NO, 2i64);
        record.set(fields::TURN_TYPE_CD, 11i64);
        record.set(fields::TURN_SPEED, 50.0);
        record.set(fields::STOP_PASS_SPEED, 60.0);
        record.set(fields::INTERVAL_SPEED, 55.0);
        record.set(fields::OBSERVE_TIME, 3i64);
        record.set(fields::IMAGE_PATH_NAME, "/img");
        record.set(fields::UNIQUE_KEY_PLAIN, "777_1700000002");
        record
    }

    #[test]
    fn spool_is_fifo_and_deletes_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = spool(&dir);

        let mut first = vehicle();
        first.set(fields::CAR_ID_2K, "1");
        let mut second = vehicle();
        second.set(fields::CAR_ID_2K, "2");
        store.insert_record(&first).unwrap();
        store.insert_record(&second).unwrap();

        let (id, payload) = store.fetch_one().unwrap().unwrap();
        let restored = Record::from_json_str(&payload).unwrap();
        assert_eq!(restored.text(fields::CAR_ID_2K), "1");

        store.delete_by_id(id).unwrap();
        let (_, payload) = store.fetch_one().unwrap().unwrap();
        let restored = Record::from_json_str(&payload).unwrap();
        assert_eq!(restored.text(fields::CAR_ID_2K), "2");
    }

    #[test]
    fn spool_round_trips_records_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = spool(&dir);

        let mut record = vehicle();
        record.mark_sent("L4", true);
        record.mark_sent("MW", false);
        store.insert_record(&record).unwrap();

        let (_, payload) = store.fetch_one().unwrap().unwrap();
        assert_eq!(Record::from_json_str(&payload).unwrap(), record);
    }

    #[test]
    fn projection_inserts_typed_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("main.db");
        let store = LocalStore::new("LOCAL", db.to_str().unwrap(), "main_table").unwrap();
        store.open().unwrap();

        store.insert_record(&vehicle()).unwrap();

        let guard = store.lock().unwrap();
        let conn = guard.as_ref().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM main_table", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let (car_id, lane): (i64, i64) = conn
            .query_row(
                "SELECT car_id_2k, lane_no FROM main_table",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(car_id, 777);
        assert_eq!(lane, 2);
    }

    #[test]
    fn unknown_table_name_rejected() {
        assert!(LocalStore::new("X", ":memory:", "other").is_err());
    }

    #[test]
    fn empty_spool_fetches_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = spool(&dir);
        assert!(store.fetch_one().unwrap().is_none());
    }
}
