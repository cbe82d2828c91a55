//! SQLite persistence for accounts and their prediction history.
//!
//! Every mutating operation runs inside its own transaction: the transaction
//! is committed on success and rolled back when dropped on any error path.

mod filter;
mod schema;

pub use filter::{
    artifact_reference, CompiledQuery, HistoryFilter, Predicate, SearchCriteria, SearchResult,
};
pub use schema::SCHEMA;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::labels::{Label, ModelVariant, VOCABULARY_SIZE};

pub type AccountId = i64;
pub type HistoryId = i64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an account with this email already exists")]
    DuplicateEmail,
    #[error("record not found")]
    NotFound,
    #[error("invalid history record: {0}")]
    InvalidRecord(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub password_hash: String,
}

/// Credential changes; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

/// A prediction ready to be persisted.
///
/// The cached maximum and the predicted label are derived from the
/// probability vector at construction, so they cannot disagree with it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryRecord {
    owner_id: AccountId,
    probabilities: Vec<f64>,
    highest_prob: f64,
    pred: Label,
    image: Vec<u8>,
    model: ModelVariant,
}

impl NewHistoryRecord {
    pub fn new(
        owner_id: AccountId,
        probabilities: Vec<f64>,
        image: Vec<u8>,
        model: ModelVariant,
    ) -> Result<Self, StoreError> {
        if probabilities.len() != VOCABULARY_SIZE {
            return Err(StoreError::InvalidRecord(format!(
                "expected {} probabilities, got {}",
                VOCABULARY_SIZE,
                probabilities.len()
            )));
        }
        let pred = Label::from_probabilities(&probabilities).ok_or_else(|| {
            StoreError::InvalidRecord("probability vector has no maximum".to_string())
        })?;
        let highest_prob = probabilities[pred.index()];

        let side = model.size() as usize;
        if image.len() != side * side * 3 {
            return Err(StoreError::InvalidRecord(format!(
                "image of {} bytes does not match the {} pixels model",
                image.len(),
                model.size()
            )));
        }

        Ok(Self {
            owner_id,
            probabilities,
            highest_prob,
            pred,
            image,
            model,
        })
    }

    pub fn owner_id(&self) -> AccountId {
        self.owner_id
    }

    pub fn pred(&self) -> Label {
        self.pred
    }

    pub fn highest_prob(&self) -> f64 {
        self.highest_prob
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: HistoryId,
    pub owner_id: AccountId,
    pub probabilities: Vec<f64>,
    pub highest_prob: f64,
    pub pred: Label,
    pub image: Vec<u8>,
    pub model: ModelVariant,
    pub created_at: DateTime<Utc>,
}

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        // Cascading deletes only fire with enforcement on, and it is per connection.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn create_account(
        &mut self,
        email: &str,
        password_hash: &str,
    ) -> Result<AccountId, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO account (email, password_hash) VALUES (?1, ?2)",
            params![email, password_hash],
        )
        .map_err(constraint_to_duplicate)?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let account = self
            .conn
            .query_row(
                "SELECT id, email, password_hash FROM account WHERE email = ?1",
                [email],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let account = self
            .conn
            .query_row(
                "SELECT id, email, password_hash FROM account WHERE id = ?1",
                [id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub fn update_account(
        &mut self,
        id: AccountId,
        update: AccountUpdate,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM account WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::NotFound);
        }
        if let Some(email) = &update.email {
            tx.execute(
                "UPDATE account SET email = ?1 WHERE id = ?2",
                params![email, id],
            )
            .map_err(constraint_to_duplicate)?;
        }
        if let Some(password_hash) = &update.password_hash {
            tx.execute(
                "UPDATE account SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes the account together with all of its history records.
    pub fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute("DELETE FROM account WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // History
    // ========================================================================

    pub fn create_history(&mut self, record: &NewHistoryRecord) -> Result<HistoryId, StoreError> {
        let probabilities = serde_json::to_string(&record.probabilities)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO history_record
                (account_id, probabilities, highest_prob, pred, image, model, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.owner_id,
                probabilities,
                record.highest_prob,
                record.pred.to_string(),
                record.image,
                record.model.tag(),
                Utc::now(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Fetches a record only if `owner_id` owns it; foreign records look absent.
    pub fn get_history(
        &self,
        id: HistoryId,
        owner_id: AccountId,
    ) -> Result<Option<HistoryRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, account_id, probabilities, highest_prob, pred, image, model, created_at
                FROM history_record
                WHERE id = ?1 AND account_id = ?2
                "#,
                params![id, owner_id],
                |row| {
                    Ok((
                        row.get::<_, HistoryId>(0)?,
                        row.get::<_, AccountId>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        parse_column::<Label>(row, 4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        parse_column::<ModelVariant>(row, 6)?,
                        row.get::<_, DateTime<Utc>>(7)?,
                    ))
                },
            )
            .optional()?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let (id, owner_id, probabilities, highest_prob, pred, image, model, created_at) = row;
        Ok(Some(HistoryRecord {
            id,
            owner_id,
            probabilities: serde_json::from_str(&probabilities)?,
            highest_prob,
            pred,
            image,
            model,
            created_at,
        }))
    }

    /// Deletes a record owned by `owner_id`. Records of other accounts are
    /// reported as [`StoreError::NotFound`].
    pub fn delete_history(
        &mut self,
        id: HistoryId,
        owner_id: AccountId,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM history_record WHERE id = ?1 AND account_id = ?2",
            params![id, owner_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count_history(&self, owner_id: AccountId) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM history_record WHERE account_id = ?1",
            [owner_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
    })
}

pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn constraint_to_duplicate(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == SQLITE_CONSTRAINT_UNIQUE => {
            StoreError::DuplicateEmail
        }
        other => other.into(),
    }
}
