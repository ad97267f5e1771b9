//! Per-app credential store (§4.3).
//!
//! A durable, process-safe key-value store keyed by app package name, so the
//! LLM can reuse a stored login instead of signing up fresh every run. Kept
//! in a database file separate from the per-run PersistenceStore since
//! credentials outlive any single run.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task panicked: {0}")]
    TaskPanic(String),
}

type Result<T> = std::result::Result<T, CredentialStoreError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub package_name: String,
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub extra_data: Option<Value>,
    pub signup_completed: bool,
    pub login_count: i64,
}

/// Summary row with the password redacted, for `list_all`.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub package_name: String,
    pub email: String,
    pub name: Option<String>,
    pub signup_completed: bool,
    pub login_count: i64,
}

#[derive(Clone)]
pub struct CredentialStore {
    conn: Arc<Mutex<Connection>>,
}

const TABLE: &str = "app_credentials";

impl CredentialStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                package_name TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                password TEXT NOT NULL,
                name TEXT,
                extra_data TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                signup_completed INTEGER NOT NULL DEFAULT 0,
                login_count INTEGER NOT NULL DEFAULT 0
            );"
        ))?;
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn).map_err(CredentialStoreError::from)
        })
        .await
        .map_err(|e| CredentialStoreError::TaskPanic(e.to_string()))?
    }

    pub async fn get(&self, package_name: &str) -> Result<Option<CredentialRecord>> {
        let package_name = package_name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT package_name, email, password, name, extra_data, signup_completed, login_count
                     FROM {TABLE} WHERE package_name = ?1"
                ),
                params![package_name],
                |r| {
                    let extra_raw: Option<String> = r.get(4)?;
                    Ok(CredentialRecord {
                        package_name: r.get(0)?,
                        email: r.get(1)?,
                        password: r.get(2)?,
                        name: r.get(3)?,
                        extra_data: extra_raw.and_then(|s| serde_json::from_str(&s).ok()),
                        signup_completed: r.get::<_, i64>(5)? != 0,
                        login_count: r.get(6)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn has(&self, package_name: &str) -> Result<bool> {
        Ok(self.get(package_name).await?.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        package_name: &str,
        email: &str,
        password: &str,
        name: Option<&str>,
        extra_data: Option<Value>,
        signup_completed: bool,
    ) -> Result<()> {
        let package_name = package_name.to_string();
        let email = email.to_string();
        let password = password.to_string();
        let name = name.map(|s| s.to_string());
        let extra_json = extra_data.map(|v| v.to_string());
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE}
                        (package_name, email, password, name, extra_data, created_at, updated_at, signup_completed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
                     ON CONFLICT(package_name) DO UPDATE SET
                        email = excluded.email,
                        password = excluded.password,
                        name = excluded.name,
                        extra_data = excluded.extra_data,
                        updated_at = excluded.updated_at,
                        signup_completed = excluded.signup_completed"
                ),
                params![package_name, email, password, name, extra_json, now, signup_completed as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn increment_login_count(&self, package_name: &str) -> Result<()> {
        let package_name = package_name.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                &format!(
                    "UPDATE {TABLE} SET login_count = login_count + 1, updated_at = ?2 WHERE package_name = ?1"
                ),
                params![package_name, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, package_name: &str) -> Result<()> {
        let package_name = package_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(&format!("DELETE FROM {TABLE} WHERE package_name = ?1"), params![package_name])?;
            Ok(())
        })
        .await
    }

    /// Passwords are never returned here.
    pub async fn list_all(&self) -> Result<Vec<CredentialSummary>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT package_name, email, name, signup_completed, login_count FROM {TABLE} ORDER BY package_name"
            ))?;
            let rows = stmt.query_map([], |r| {
                Ok(CredentialSummary {
                    package_name: r.get(0)?,
                    email: r.get(1)?,
                    name: r.get(2)?,
                    signup_completed: r.get::<_, i64>(3)? != 0,
                    login_count: r.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn has_false_until_stored() {
        let store = CredentialStore::open_in_memory().unwrap();
        assert!(!store.has("com.example").await.unwrap());
        store.store("com.example", "test@email.com", "Test123!", None, None, true).await.unwrap();
        assert!(store.has("com.example").await.unwrap());
    }

    #[tokio::test]
    async fn get_returns_stored_fields() {
        let store = CredentialStore::open_in_memory().unwrap();
        store
            .store("com.example", "test@email.com", "Test123!", Some("Tester"), None, true)
            .await
            .unwrap();
        let rec = store.get("com.example").await.unwrap().unwrap();
        assert_eq!(rec.email, "test@email.com");
        assert_eq!(rec.password, "Test123!");
        assert!(rec.signup_completed);
        assert_eq!(rec.login_count, 0);
    }

    #[tokio::test]
    async fn store_is_upsert_last_write_wins() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.store("com.example", "a@x.com", "p1", None, None, true).await.unwrap();
        store.store("com.example", "b@x.com", "p2", None, None, true).await.unwrap();
        let rec = store.get("com.example").await.unwrap().unwrap();
        assert_eq!(rec.email, "b@x.com");
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn increment_login_count_increments() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.store("com.example", "a@x.com", "p1", None, None, true).await.unwrap();
        store.increment_login_count("com.example").await.unwrap();
        store.increment_login_count("com.example").await.unwrap();
        let rec = store.get("com.example").await.unwrap().unwrap();
        assert_eq!(rec.login_count, 2);
    }

    #[tokio::test]
    async fn list_all_never_includes_password() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.store("com.example", "a@x.com", "secret", None, None, true).await.unwrap();
        let all = store.list_all().await.unwrap();
        let serialized = serde_json::to_string(&all).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.store("com.example", "a@x.com", "p1", None, None, true).await.unwrap();
        store.delete("com.example").await.unwrap();
        assert!(!store.has("com.example").await.unwrap());
    }
}
