//! Linked-account persistence using SQLite.
//!
//! Owns three tables:
//!
//! - `riot_accounts` — linked accounts, one row per Riot player (`puuid`
//!   is globally unique; `(requester_id, nickname)` is unique per user)
//! - `link_states` — pending link challenges, consumed at most once
//! - `daily_store_schedules` — recurring store posts, cascade-deleted with
//!   their account
//!
//! Secrets arrive here already encrypted; this module stores blobs and
//! never touches the cipher.
//!
//! # Thread safety
//! The connection is wrapped in a `Mutex` and every multi-statement
//! mutation runs inside an immediate transaction, so concurrent handshakes
//! for the same player serialize on the storage layer.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

/// Entropy of a challenge token in bytes (192 bits)
const CHALLENGE_TOKEN_BYTES: usize = 24;

/// A linked Riot account.
#[derive(Clone, Debug)]
pub struct LinkedAccount {
    pub id: i64,
    /// Chat-platform user id that owns the link
    pub requester_id: i64,
    /// User-facing alias, unique per requester, ≤50 chars
    pub nickname: String,
    /// Riot id in `name#tag` form
    pub riot_id: String,
    /// Encrypted session cookie blob (or encrypted placeholder)
    pub encrypted_secret: String,
    pub access_token: String,
    pub entitlement_token: String,
    /// Provider-issued player id, globally unique
    pub puuid: String,
    /// Regional routing key for data fetches
    pub shard: String,
    pub created_at: DateTime<Utc>,
}

/// Fields of an account as produced by a completed handshake.
#[derive(Clone, Debug)]
pub struct NewLinkedAccount {
    pub requester_id: i64,
    /// Proposed nickname (normally the riot_id); suffixed on collision
    pub nickname: String,
    pub riot_id: String,
    pub encrypted_secret: String,
    pub access_token: String,
    pub entitlement_token: String,
    pub puuid: String,
    pub shard: String,
}

/// A recurring daily-store post.
#[derive(Clone, Debug)]
pub struct StoreSchedule {
    pub id: i64,
    pub requester_id: i64,
    pub account_id: i64,
    pub guild_id: i64,
    pub channel_id: i64,
    /// `HH:MM`, 24-hour
    pub schedule_time: String,
}

/// Outcome of a rename attempt.
#[derive(Debug, PartialEq)]
pub enum RenameOutcome {
    Renamed,
    NameTaken,
    NotFound,
}

/// Persists linked accounts, pending challenges, and schedules.
pub struct LinkStore {
    conn: Mutex<Connection>,
    challenge_ttl: Duration,
}

impl LinkStore {
    /// Opens (or creates) the database and ensures the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P, challenge_ttl: Duration) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open link database")?;

        // Required for the schedule cascade on account deletion
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS riot_accounts (
                id                INTEGER PRIMARY KEY,
                requester_id      INTEGER NOT NULL,
                nickname          TEXT NOT NULL,
                riot_id           TEXT NOT NULL,
                encrypted_secret  TEXT NOT NULL,
                access_token      TEXT NOT NULL,
                entitlement_token TEXT NOT NULL,
                puuid             TEXT NOT NULL UNIQUE,
                shard             TEXT NOT NULL DEFAULT 'ap',
                created_at        TEXT NOT NULL,
                UNIQUE(requester_id, nickname)
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_requester
                ON riot_accounts(requester_id);

            CREATE TABLE IF NOT EXISTS link_states (
                token        TEXT PRIMARY KEY,
                requester_id INTEGER NOT NULL,
                expires_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_store_schedules (
                id            INTEGER PRIMARY KEY,
                requester_id  INTEGER NOT NULL,
                account_id    INTEGER NOT NULL
                    REFERENCES riot_accounts(id) ON DELETE CASCADE,
                guild_id      INTEGER NOT NULL,
                channel_id    INTEGER NOT NULL,
                schedule_time TEXT NOT NULL,
                UNIQUE(requester_id, guild_id, channel_id)
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_account
                ON daily_store_schedules(account_id);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            challenge_ttl,
        })
    }

    // ---- Challenge registry ----

    /// Issues a one-time challenge bound to the requester.
    ///
    /// Returns the opaque token (192 bits of OS randomness, urlsafe-base64)
    /// and when it stops being redeemable.
    pub fn issue_challenge(&self, requester_id: i64) -> Result<(String, DateTime<Utc>)> {
        let mut bytes = [0u8; CHALLENGE_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let expires_at = Utc::now() + self.challenge_ttl;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO link_states (token, requester_id, expires_at) VALUES (?1, ?2, ?3)",
            params![token, requester_id, expires_at.to_rfc3339()],
        )
        .context("Failed to insert challenge")?;

        Ok((token, expires_at))
    }

    /// Resolves and consumes a challenge token.
    ///
    /// A single `DELETE ... RETURNING` makes consumption atomic: of any
    /// number of concurrent resolutions for the same token, exactly one
    /// sees the row. Expired rows are removed by the same delete and
    /// reported as absent.
    pub fn consume_challenge(&self, token: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(i64, String)> = conn
            .query_row(
                "DELETE FROM link_states WHERE token = ?1 RETURNING requester_id, expires_at",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to consume challenge")?;

        let Some((requester_id, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .context("Failed to parse challenge expiry")?
            .with_timezone(&Utc);

        if expires_at < Utc::now() {
            // Stale challenge; the delete above already removed it
            return Ok(None);
        }

        Ok(Some(requester_id))
    }

    /// Number of pending challenges (monitoring / tests).
    pub fn challenge_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM link_states", [], |row| row.get(0))
            .context("Failed to count challenges")?;
        Ok(count as usize)
    }

    // ---- Accounts ----

    /// Inserts or updates a linked account after a completed handshake.
    ///
    /// Keyed on the `puuid` unique constraint: a player already linked —
    /// by this requester or any other — has their existing row updated in
    /// place (tokens, secret, riot_id, and ownership), never duplicated.
    /// A nickname already taken by the owning requester gets a numeric
    /// suffix derived from the current time.
    ///
    /// The collision check and the conditional write run inside one
    /// immediate transaction, so two concurrent handshakes for the same
    /// player cannot both insert.
    pub fn upsert_account(&self, new: &NewLinkedAccount) -> Result<LinkedAccount> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT requester_id, nickname FROM riot_accounts WHERE puuid = ?1",
                params![new.puuid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to check existing link")?;

        // A re-link by the same requester keeps the stored alias. A re-link
        // by a different requester carries the alias over, suffixed if the
        // new owner already uses it. Fresh inserts resolve the proposed name.
        let nickname = match &existing {
            Some((owner, stored)) if *owner == new.requester_id => stored.clone(),
            Some((_, stored)) => self.resolve_nickname(&tx, new.requester_id, stored)?,
            None => self.resolve_nickname(&tx, new.requester_id, &new.nickname)?,
        };

        tx.execute(
            r#"
            INSERT INTO riot_accounts (
                requester_id, nickname, riot_id, encrypted_secret,
                access_token, entitlement_token, puuid, shard, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(puuid) DO UPDATE SET
                requester_id = excluded.requester_id,
                nickname = excluded.nickname,
                riot_id = excluded.riot_id,
                encrypted_secret = excluded.encrypted_secret,
                access_token = excluded.access_token,
                entitlement_token = excluded.entitlement_token,
                shard = excluded.shard
            "#,
            params![
                new.requester_id,
                nickname,
                new.riot_id,
                new.encrypted_secret,
                new.access_token,
                new.entitlement_token,
                new.puuid,
                new.shard,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to upsert account")?;

        let account = tx
            .query_row(
                &format!("SELECT {} FROM riot_accounts WHERE puuid = ?1", ACCOUNT_COLS),
                params![new.puuid],
                account_from_row,
            )
            .context("Failed to read upserted account")?;

        tx.commit().context("Failed to commit upsert")?;
        Ok(account)
    }

    /// Picks a free nickname for the requester, suffixing on collision.
    fn resolve_nickname(
        &self,
        tx: &rusqlite::Transaction<'_>,
        requester_id: i64,
        proposed: &str,
    ) -> Result<String> {
        let taken: Option<i64> = tx
            .query_row(
                "SELECT id FROM riot_accounts WHERE requester_id = ?1 AND nickname = ?2",
                params![requester_id, proposed],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check nickname")?;

        if taken.is_none() {
            return Ok(proposed.to_string());
        }
        Ok(format!("{}_{}", proposed, Utc::now().timestamp() % 1000))
    }

    pub fn get_account(&self, account_id: i64) -> Result<Option<LinkedAccount>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM riot_accounts WHERE id = ?1", ACCOUNT_COLS),
            params![account_id],
            account_from_row,
        )
        .optional()
        .context("Failed to load account")
    }

    pub fn list_accounts(&self, requester_id: i64) -> Result<Vec<LinkedAccount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM riot_accounts WHERE requester_id = ?1 ORDER BY created_at ASC",
                ACCOUNT_COLS
            ))
            .context("Failed to prepare account query")?;

        let accounts = stmt
            .query_map(params![requester_id], account_from_row)
            .context("Failed to query accounts")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read account rows")?;

        Ok(accounts)
    }

    /// Persists freshly exchanged tokens and returns the updated row.
    ///
    /// Update and re-read happen inside one transaction, so the returned
    /// account reflects exactly what was written even if another refresh
    /// raced this one (last writer wins).
    pub fn refresh_tokens(
        &self,
        account_id: i64,
        access_token: &str,
        entitlement_token: &str,
    ) -> Result<Option<LinkedAccount>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let updated = tx
            .execute(
                "UPDATE riot_accounts SET access_token = ?1, entitlement_token = ?2 WHERE id = ?3",
                params![access_token, entitlement_token, account_id],
            )
            .context("Failed to update tokens")?;

        if updated == 0 {
            return Ok(None);
        }

        let account = tx
            .query_row(
                &format!("SELECT {} FROM riot_accounts WHERE id = ?1", ACCOUNT_COLS),
                params![account_id],
                account_from_row,
            )
            .context("Failed to re-read account")?;

        tx.commit().context("Failed to commit token refresh")?;
        Ok(Some(account))
    }

    /// Renames an account's alias. Owner-scoped; rejects duplicates.
    pub fn rename_account(
        &self,
        requester_id: i64,
        account_id: i64,
        new_name: &str,
    ) -> Result<RenameOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT id FROM riot_accounts WHERE requester_id = ?1 AND nickname = ?2",
                params![requester_id, new_name],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check nickname")?;
        if taken.is_some() {
            return Ok(RenameOutcome::NameTaken);
        }

        let updated = tx
            .execute(
                "UPDATE riot_accounts SET nickname = ?1 WHERE id = ?2 AND requester_id = ?3",
                params![new_name, account_id, requester_id],
            )
            .context("Failed to rename account")?;

        tx.commit().context("Failed to commit rename")?;

        if updated == 0 {
            Ok(RenameOutcome::NotFound)
        } else {
            Ok(RenameOutcome::Renamed)
        }
    }

    /// Unlinks an account. Dependent schedules are removed by the cascade
    /// in the same statement. Owner-scoped.
    pub fn delete_account(&self, requester_id: i64, account_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM riot_accounts WHERE id = ?1 AND requester_id = ?2",
                params![account_id, requester_id],
            )
            .context("Failed to delete account")?;
        Ok(deleted > 0)
    }

    // ---- Schedules ----

    /// Creates or updates the requester's schedule for a channel.
    ///
    /// One schedule per (requester, guild, channel); re-adding updates the
    /// account and time in place.
    pub fn upsert_schedule(
        &self,
        requester_id: i64,
        account_id: i64,
        guild_id: i64,
        channel_id: i64,
        schedule_time: &str,
    ) -> Result<StoreSchedule> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO daily_store_schedules
                (requester_id, account_id, guild_id, channel_id, schedule_time)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(requester_id, guild_id, channel_id) DO UPDATE SET
                account_id = excluded.account_id,
                schedule_time = excluded.schedule_time
            "#,
            params![requester_id, account_id, guild_id, channel_id, schedule_time],
        )
        .context("Failed to upsert schedule")?;

        conn.query_row(
            r#"
            SELECT id, requester_id, account_id, guild_id, channel_id, schedule_time
            FROM daily_store_schedules
            WHERE requester_id = ?1 AND guild_id = ?2 AND channel_id = ?3
            "#,
            params![requester_id, guild_id, channel_id],
            schedule_from_row,
        )
        .context("Failed to read upserted schedule")
    }

    /// Schedules the requester has in a guild, with the account nickname.
    pub fn list_schedules(
        &self,
        requester_id: i64,
        guild_id: i64,
    ) -> Result<Vec<(StoreSchedule, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT s.id, s.requester_id, s.account_id, s.guild_id, s.channel_id,
                       s.schedule_time, a.nickname
                FROM daily_store_schedules s
                JOIN riot_accounts a ON s.account_id = a.id
                WHERE s.requester_id = ?1 AND s.guild_id = ?2
                "#,
            )
            .context("Failed to prepare schedule query")?;

        let rows = stmt
            .query_map(params![requester_id, guild_id], |row| {
                Ok((schedule_from_row(row)?, row.get::<_, String>(6)?))
            })
            .context("Failed to query schedules")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read schedule rows")?;

        Ok(rows)
    }

    /// All schedules due at the given `HH:MM`, with the account's riot_id.
    /// The minute-matching loop itself lives with the caller.
    pub fn due_schedules(&self, hhmm: &str) -> Result<Vec<(StoreSchedule, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT s.id, s.requester_id, s.account_id, s.guild_id, s.channel_id,
                       s.schedule_time, a.riot_id
                FROM daily_store_schedules s
                JOIN riot_accounts a ON s.account_id = a.id
                WHERE s.schedule_time = ?1
                "#,
            )
            .context("Failed to prepare due-schedule query")?;

        let rows = stmt
            .query_map(params![hhmm], |row| {
                Ok((schedule_from_row(row)?, row.get::<_, String>(6)?))
            })
            .context("Failed to query due schedules")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read due-schedule rows")?;

        Ok(rows)
    }

    /// Deletes a schedule the requester owns. Returns false if absent.
    pub fn delete_schedule(&self, requester_id: i64, schedule_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM daily_store_schedules WHERE id = ?1 AND requester_id = ?2",
                params![schedule_id, requester_id],
            )
            .context("Failed to delete schedule")?;
        Ok(deleted > 0)
    }
}

const ACCOUNT_COLS: &str = "id, requester_id, nickname, riot_id, encrypted_secret, \
     access_token, entitlement_token, puuid, shard, created_at";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkedAccount> {
    let created_at: String = row.get(9)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(LinkedAccount {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        nickname: row.get(2)?,
        riot_id: row.get(3)?,
        encrypted_secret: row.get(4)?,
        access_token: row.get(5)?,
        entitlement_token: row.get(6)?,
        puuid: row.get(7)?,
        shard: row.get(8)?,
        created_at,
    })
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreSchedule> {
    Ok(StoreSchedule {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        account_id: row.get(2)?,
        guild_id: row.get(3)?,
        channel_id: row.get(4)?,
        schedule_time: row.get(5)?,
    })
}
