//! ufleet persistence: durable kv tree on SQLite.
//! Same node semantics and change feed as the in-memory backend.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension};
use tracing::info;
use ufleet_core::{Action, Error, Result};
use ufleet_store::kv::{normalize, parent};
use ufleet_store::{ChangeFeed, KvBackend, KvChange, KvNode, KvWatcher};

/// SQLite-backed tree. Simple and synchronous; writes are serialized by the connection mutex.
pub struct SqliteKv {
    db: Mutex<rusqlite::Connection>,
    feed: ChangeFeed,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::upstream(format!("sqlite: {}", e))
}

/// Key range strictly below `dir`: `(dir/, dir0)` since '0' follows '/'.
fn child_range(dir: &str) -> (String, String) {
    if dir == "/" {
        ("/".to_string(), "0".to_string())
    } else {
        (format!("{}/", dir), format!("{}0", dir))
    }
}

impl SqliteKv {
    pub fn open_default(watch_buffer: usize) -> Result<Self> {
        let path = std::env::var("UFLEET_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path, watch_buffer)
    }

    pub fn open(path: &str, watch_buffer: usize) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).map_err(|e| Error::upstream(format!("opening sqlite db at {}: {}", path, e)))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                key   TEXT PRIMARY KEY,
                value TEXT,
                dir   INTEGER NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(%path, "sqlite kv opened");
        Ok(Self { db: Mutex::new(db), feed: ChangeFeed::new(watch_buffer) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| Error::internal("sqlite connection mutex poisoned"))
    }

    fn lookup(db: &rusqlite::Connection, key: &str) -> Result<Option<(Option<String>, bool)>> {
        db.query_row("SELECT value, dir FROM nodes WHERE key = ?1", [key], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, bool>(1)?))
        })
        .optional()
        .map_err(db_err)
    }
}

#[async_trait]
impl KvBackend for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<KvNode>> {
        let key = normalize(key);
        let db = self.conn()?;
        Ok(Self::lookup(&db, &key)?.map(|(value, dir)| KvNode { key, value, dir }))
    }

    async fn create(&self, key: &str, value: Option<&str>) -> Result<()> {
        let key = normalize(key);
        if key == "/" {
            return Err(Error::already_exists("/"));
        }
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(db_err)?;
        if Self::lookup(&tx, &key)?.is_some() {
            return Err(Error::already_exists(&key));
        }
        let mut created = Vec::new();
        let mut cur = parent(&key);
        while let Some(p) = cur {
            if p == "/" {
                break;
            }
            match Self::lookup(&tx, p)? {
                Some((_, false)) => return Err(Error::invalid(format!("{} is not a directory", p))),
                Some(_) => break,
                None => {
                    tx.execute("INSERT INTO nodes(key, value, dir) VALUES (?1, NULL, 1)", [p]).map_err(db_err)?;
                    created.push(p.to_string());
                }
            }
            cur = parent(p);
        }
        tx.execute("INSERT INTO nodes(key, value, dir) VALUES (?1, ?2, ?3)", params![key, value, value.is_none()])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        for p in created.into_iter().rev() {
            self.feed.publish(KvChange { action: Action::Create, key: p, value: None, prev_value: None, dir: true });
        }
        self.feed.publish(KvChange { action: Action::Create, key, value: value.map(str::to_string), prev_value: None, dir: value.is_none() });
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1);
        Ok(())
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        let key = normalize(key);
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(db_err)?;
        let prev = match Self::lookup(&tx, &key)? {
            None => return Err(Error::not_found(&key)),
            Some((_, true)) => return Err(Error::invalid(format!("{} is a directory", key))),
            Some((prev, false)) => prev,
        };
        tx.execute("UPDATE nodes SET value = ?2 WHERE key = ?1", params![key, value]).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        self.feed.publish(KvChange { action: Action::Update, key, value: Some(value.to_string()), prev_value: prev, dir: false });
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1);
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = normalize(key);
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(db_err)?;
        let (prev, dir) = Self::lookup(&tx, &key)?.ok_or_else(|| Error::not_found(&key))?;
        if dir {
            let (lo, hi) = child_range(&key);
            let below: i64 = tx
                .query_row("SELECT COUNT(*) FROM nodes WHERE key > ?1 AND key < ?2", params![lo, hi], |r| r.get(0))
                .map_err(db_err)?;
            if below > 0 && !recursive {
                return Err(Error::invalid(format!("directory {} not empty", key)));
            }
            tx.execute("DELETE FROM nodes WHERE key > ?1 AND key < ?2", params![lo, hi]).map_err(db_err)?;
        }
        tx.execute("DELETE FROM nodes WHERE key = ?1", [&key]).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        self.feed.publish(KvChange { action: Action::Delete, key, value: None, prev_value: prev, dir });
        counter!("persist_delete_total", 1);
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvNode>> {
        let dir = normalize(dir);
        let started = std::time::Instant::now();
        let db = self.conn()?;
        if dir != "/" {
            match Self::lookup(&db, &dir)? {
                None => return Err(Error::not_found(&dir)),
                Some((_, false)) => return Err(Error::invalid(format!("{} is not a directory", dir))),
                Some(_) => {}
            }
        }
        let (lo, hi) = child_range(&dir);
        let mut stmt = db
            .prepare("SELECT key, value, dir FROM nodes WHERE key > ?1 AND key < ?2 ORDER BY key")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![lo, hi]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let key: String = row.get(0).map_err(db_err)?;
            if key[lo.len()..].contains('/') {
                continue;
            }
            out.push(KvNode { key, value: row.get(1).map_err(db_err)?, dir: row.get(2).map_err(db_err)? });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn watch(&self, prefix: &str) -> KvWatcher {
        self.feed.subscribe(prefix)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".ufleet");
        let _ = std::fs::create_dir_all(&p);
        p.push("ufleet.db");
        return p.to_string_lossy().to_string();
    }
    "ufleet.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("ufleet-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn tree_semantics_match_memory_backend() {
        let kv = SqliteKv::open(&temp_db(), 64).unwrap();
        kv.create("/r/ConfigMap/g1/w1/cfg", Some("v1")).await.unwrap();
        assert!(kv.create("/r/ConfigMap/g1/w1/cfg", Some("v1")).await.unwrap_err().is_already_exists());
        assert!(kv.get("/r/ConfigMap/g1").await.unwrap().unwrap().dir);
        kv.update("/r/ConfigMap/g1/w1/cfg", "v2").await.unwrap();
        assert!(kv.update("/r/ConfigMap/g1/w1/nope", "v").await.unwrap_err().is_not_found());

        kv.create("/r/ConfigMap/g1/w2", None).await.unwrap();
        let names: Vec<String> = kv.list("/r/ConfigMap/g1").await.unwrap().iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["w1", "w2"]);

        assert!(matches!(kv.delete("/r/ConfigMap/g1", false).await, Err(Error::Invalid(_))));
        kv.delete("/r/ConfigMap/g1", true).await.unwrap();
        assert!(kv.get("/r/ConfigMap/g1/w1/cfg").await.unwrap().is_none());
        assert!(kv.delete("/r/ConfigMap/g1", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn reopen_keeps_records_and_feed_reports_changes() {
        let path = temp_db();
        {
            let kv = SqliteKv::open(&path, 64).unwrap();
            let mut w = kv.watch("/r");
            kv.create("/r/a", Some("1")).await.unwrap();
            let parent = w.next().await.unwrap();
            assert_eq!((parent.key.as_str(), parent.dir), ("/r", true));
            let c = w.next().await.unwrap();
            assert_eq!((c.action, c.key.as_str(), c.value.as_deref()), (Action::Create, "/r/a", Some("1")));
        }
        let kv = SqliteKv::open(&path, 64).unwrap();
        assert_eq!(kv.get("/r/a").await.unwrap().unwrap().value.as_deref(), Some("1"));
    }
}
