//! Persistent bridge store.
//!
//! Four tables over one SQLite database shared by both listener processes:
//! `users` (registrations), `blocks` (user-level block list), `instb`
//! (bridge-wide block list) and `comm` (per-delivery correspondence log used
//! to resolve replies and resends). Multi-statement mutations run inside an
//! immediate transaction because the two processes write concurrently.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Builder, Connection, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::Side;

/// SQL schema for the bridge store.
pub const SCHEMA: &str = r#"
-- Registered bridge participants. A row outlives revocation so the
-- re-registration counter and retention policy can act on it.
CREATE TABLE IF NOT EXISTS users (
    side INTEGER NOT NULL,
    user TEXT NOT NULL,
    -- Last registration request; NULL until first activation
    req_date TEXT,
    -- Count of registration attempts
    nb_reg INTEGER NOT NULL DEFAULT 0,
    -- Two-letter UI language
    lang TEXT NOT NULL,
    -- NULL while the registration is active
    revoke_date TEXT,
    -- Source application label (nodeinfo software name, or "XMPP")
    app TEXT NOT NULL,
    -- Opaque sender-side account id (used for Fediverse unfollow)
    acc_id TEXT NOT NULL,
    PRIMARY KEY (side, user)
);

-- One user (side, blocking) has blocked one address on the opposite side.
CREATE TABLE IF NOT EXISTS blocks (
    side INTEGER NOT NULL,
    blocking TEXT NOT NULL,
    blocked TEXT NOT NULL,
    block_date TEXT NOT NULL,
    PRIMARY KEY (side, blocking, blocked)
);

-- Bridge-wide admin block list; side is the side of the blocked address.
CREATE TABLE IF NOT EXISTS instb (
    side INTEGER NOT NULL,
    blocked TEXT NOT NULL,
    block_date TEXT NOT NULL,
    PRIMARY KEY (side, blocked)
);

-- Correspondence log, one row per successful delivery to one recipient.
-- side is the side of the recipient (user); from_u lives on the opposite
-- side. id_from is the sender-side message id, id_to the recipient-side id.
CREATE TABLE IF NOT EXISTS comm (
    side INTEGER NOT NULL,
    user TEXT NOT NULL,
    from_u TEXT NOT NULL,
    from_date TEXT NOT NULL,
    id_from TEXT NOT NULL,
    id_to TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_comm_id_to ON comm(side, id_to);
CREATE INDEX IF NOT EXISTS idx_comm_id_from ON comm(side, id_from);
CREATE INDEX IF NOT EXISTS idx_comm_user ON comm(side, user, from_date DESC);
CREATE INDEX IF NOT EXISTS idx_comm_from_u ON comm(side, from_u, from_date DESC);
"#;

/// A row of `users`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub side: Side,
    pub user: String,
    pub req_date: Option<DateTime<Utc>>,
    pub nb_reg: i64,
    pub lang: String,
    pub revoke_date: Option<DateTime<Utc>>,
    pub app: String,
    pub acc_id: String,
}

impl UserRow {
    /// A registration is active while it has not been revoked.
    pub fn is_active(&self) -> bool {
        self.revoke_date.is_none()
    }

    /// Domain part of the stored address.
    pub fn domain(&self) -> &str {
        self.user.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }
}

/// A row of `blocks`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub side: Side,
    pub blocking: String,
    pub blocked: String,
    pub block_date: DateTime<Utc>,
}

/// A row of `instb`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstBlockRow {
    pub side: Side,
    pub blocked: String,
    pub block_date: DateTime<Utc>,
}

/// A row of `comm`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommRow {
    pub side: Side,
    pub user: String,
    pub from_u: String,
    pub from_date: DateTime<Utc>,
    pub id_from: String,
    pub id_to: String,
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    // Fixed width so lexicographic order in SQL matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw}: {e}")))
}

fn decode_side(raw: i64) -> Result<Side, StoreError> {
    Side::from_db(raw).ok_or_else(|| StoreError::Corrupt(format!("bad side value {raw}")))
}

fn user_from_row(row: &libsql::Row) -> Result<UserRow, StoreError> {
    let req_date: Option<String> = row.get(2).ok();
    let revoke_date: Option<String> = row.get(5).ok();
    Ok(UserRow {
        side: decode_side(row.get(0)?)?,
        user: row.get(1)?,
        req_date: req_date.as_deref().map(decode_ts).transpose()?,
        nb_reg: row.get(3)?,
        lang: row.get(4)?,
        revoke_date: revoke_date.as_deref().map(decode_ts).transpose()?,
        app: row.get(6)?,
        acc_id: row.get(7)?,
    })
}

fn comm_from_row(row: &libsql::Row) -> Result<CommRow, StoreError> {
    Ok(CommRow {
        side: decode_side(row.get(0)?)?,
        user: row.get(1)?,
        from_u: row.get(2)?,
        from_date: decode_ts(&row.get::<String>(3)?)?,
        id_from: row.get(4)?,
        id_to: row.get(5)?,
    })
}

const USER_COLS: &str = "side, user, req_date, nb_reg, lang, revoke_date, app, acc_id";
const COMM_COLS: &str = "side, user, from_u, from_date, id_from, id_to";

/// Handle on the shared bridge database.
#[derive(Clone)]
pub struct BridgeStore {
    conn: Arc<Mutex<Connection>>,
}

impl BridgeStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: &std::path::Path) -> Result<BridgeStore, StoreError> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        let store = BridgeStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        info!(path = %path.display(), "bridge store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<BridgeStore, StoreError> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;
        let store = BridgeStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(SCHEMA).await?;
        debug!("bridge store schema ensured");
        Ok(())
    }

    // ---- users ----

    /// Fetch one user row.
    pub async fn user(&self, side: Side, user: &str) -> Result<Option<UserRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLS} FROM users WHERE side = ?1 AND user = ?2"),
                params![side.as_db(), user],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(user_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// True when the user exists and is not revoked.
    pub async fn is_active(&self, side: Side, user: &str) -> Result<bool, StoreError> {
        Ok(self
            .user(side, user)
            .await?
            .is_some_and(|row| row.is_active()))
    }

    /// Insert a fresh user row (never registered yet: `nb_reg = 0`).
    pub async fn insert_user(&self, row: &UserRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO users({USER_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                row.side.as_db(),
                row.user.as_str(),
                row.req_date.map(encode_ts),
                row.nb_reg,
                row.lang.as_str(),
                row.revoke_date.map(encode_ts),
                row.app.as_str(),
                row.acc_id.as_str()
            ],
        )
        .await?;
        Ok(())
    }

    /// Activate (or re-activate) a registration: bump the counter, stamp the
    /// request date, clear the revocation.
    pub async fn activate_user(
        &self,
        side: Side,
        user: &str,
        nb_reg: i64,
        lang: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET req_date = ?1, nb_reg = ?2, lang = ?3, revoke_date = NULL \
             WHERE side = ?4 AND user = ?5",
            params![encode_ts(now), nb_reg, lang, side.as_db(), user],
        )
        .await?;
        Ok(())
    }

    /// Update a user's language. Returns false when the user is unknown.
    pub async fn set_lang(&self, side: Side, user: &str, lang: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE users SET lang = ?1 WHERE side = ?2 AND user = ?3",
                params![lang, side.as_db(), user],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Revoke a registration and drop its dependent rows in one
    /// transaction: the user's own block entries, and every correspondence
    /// where the user appears as recipient (their side) or as sender
    /// (opposite side).
    pub async fn revoke_user(
        &self,
        side: Side,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;
        tx.execute(
            "UPDATE users SET revoke_date = ?1 WHERE side = ?2 AND user = ?3",
            params![encode_ts(now), side.as_db(), user],
        )
        .await?;
        tx.execute(
            "DELETE FROM blocks WHERE side = ?1 AND blocking = ?2",
            params![side.as_db(), user],
        )
        .await?;
        tx.execute(
            "DELETE FROM comm WHERE side = ?1 AND user = ?2",
            params![side.as_db(), user],
        )
        .await?;
        tx.execute(
            "DELETE FROM comm WHERE side = ?1 AND from_u = ?2",
            params![side.opposite().as_db(), user],
        )
        .await?;
        tx.commit().await?;
        debug!(%side, user, "registration revoked");
        Ok(())
    }

    /// Remove a revoked user row entirely, with the same dependent cleanup
    /// as revocation. Used by the retention sweep.
    pub async fn delete_user(&self, side: Side, user: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;
        tx.execute(
            "DELETE FROM users WHERE side = ?1 AND user = ?2",
            params![side.as_db(), user],
        )
        .await?;
        tx.execute(
            "DELETE FROM blocks WHERE side = ?1 AND blocking = ?2",
            params![side.as_db(), user],
        )
        .await?;
        tx.execute(
            "DELETE FROM comm WHERE side = ?1 AND user = ?2",
            params![side.as_db(), user],
        )
        .await?;
        tx.execute(
            "DELETE FROM comm WHERE side = ?1 AND from_u = ?2",
            params![side.opposite().as_db(), user],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// All active users, most recently registered first.
    pub async fn active_users(&self) -> Result<Vec<UserRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLS} FROM users WHERE revoke_date IS NULL \
                     ORDER BY req_date DESC"
                ),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(user_from_row(&row)?);
        }
        Ok(out)
    }

    /// Count of active users.
    pub async fn active_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM users WHERE revoke_date IS NULL", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Revoked users of one side (retention sweep input).
    pub async fn revoked_users(&self, side: Side) -> Result<Vec<UserRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLS} FROM users \
                     WHERE side = ?1 AND revoke_date IS NOT NULL"
                ),
                params![side.as_db()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(user_from_row(&row)?);
        }
        Ok(out)
    }

    // ---- blocks ----

    /// True when `blocking` (on `side`) has blocked `blocked`.
    pub async fn has_block(
        &self,
        side: Side,
        blocking: &str,
        blocked: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM blocks WHERE side = ?1 AND blocking = ?2 AND blocked = ?3",
                params![side.as_db(), blocking, blocked],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Insert a personal block. Returns false when it already existed.
    pub async fn add_block(
        &self,
        side: Side,
        blocking: &str,
        blocked: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO blocks(side, blocking, blocked, block_date) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![side.as_db(), blocking, blocked, encode_ts(now)],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Remove a personal block. Returns false when it did not exist.
    pub async fn del_block(
        &self,
        side: Side,
        blocking: &str,
        blocked: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM blocks WHERE side = ?1 AND blocking = ?2 AND blocked = ?3",
                params![side.as_db(), blocking, blocked],
            )
            .await?;
        Ok(changed > 0)
    }

    /// One user's block list, most recent first.
    pub async fn blocks_of(&self, side: Side, blocking: &str) -> Result<Vec<BlockRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT side, blocking, blocked, block_date FROM blocks \
                 WHERE side = ?1 AND blocking = ?2 ORDER BY block_date DESC",
                params![side.as_db(), blocking],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(BlockRow {
                side: decode_side(row.get(0)?)?,
                blocking: row.get(1)?,
                blocked: row.get(2)?,
                block_date: decode_ts(&row.get::<String>(3)?)?,
            });
        }
        Ok(out)
    }

    // ---- instance blocks ----

    /// True when `blocked` (on `side`) is blocked bridge-wide.
    pub async fn has_inst_block(&self, side: Side, blocked: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM instb WHERE side = ?1 AND blocked = ?2",
                params![side.as_db(), blocked],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Insert a bridge-wide block. Returns false when it already existed.
    pub async fn add_inst_block(
        &self,
        side: Side,
        blocked: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO instb(side, blocked, block_date) VALUES (?1, ?2, ?3)",
                params![side.as_db(), blocked, encode_ts(now)],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Remove a bridge-wide block. Returns false when it did not exist.
    pub async fn del_inst_block(&self, side: Side, blocked: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM instb WHERE side = ?1 AND blocked = ?2",
                params![side.as_db(), blocked],
            )
            .await?;
        Ok(changed > 0)
    }

    /// The whole bridge-wide block list, most recent first.
    pub async fn inst_blocks(&self) -> Result<Vec<InstBlockRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT side, blocked, block_date FROM instb ORDER BY block_date DESC",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(InstBlockRow {
                side: decode_side(row.get(0)?)?,
                blocked: row.get(1)?,
                block_date: decode_ts(&row.get::<String>(2)?)?,
            });
        }
        Ok(out)
    }

    // ---- correspondence log ----

    /// Record one successful delivery.
    pub async fn add_comm(&self, row: &CommRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO comm({COMM_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                row.side.as_db(),
                row.user.as_str(),
                row.from_u.as_str(),
                encode_ts(row.from_date),
                row.id_from.as_str(),
                row.id_to.as_str()
            ],
        )
        .await?;
        Ok(())
    }

    /// "Who sent me this": resolve a recipient-side message id.
    pub async fn comm_by_id_to(
        &self,
        side: Side,
        id_to: &str,
    ) -> Result<Option<CommRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {COMM_COLS} FROM comm WHERE side = ?1 AND id_to = ?2"),
                params![side.as_db(), id_to],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(comm_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// "Who did I fan out to": all deliveries sharing one sender-side id.
    pub async fn comm_by_id_from(
        &self,
        side: Side,
        id_from: &str,
    ) -> Result<Vec<CommRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {COMM_COLS} FROM comm WHERE side = ?1 AND id_from = ?2"),
                params![side.as_db(), id_from],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(comm_from_row(&row)?);
        }
        Ok(out)
    }

    /// Most recent delivery *to* this user (the last inbound message they got).
    pub async fn last_comm_to(
        &self,
        side: Side,
        user: &str,
    ) -> Result<Option<CommRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {COMM_COLS} FROM comm WHERE side = ?1 AND user = ?2 \
                     ORDER BY from_date DESC LIMIT 1"
                ),
                params![side.as_db(), user],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(comm_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent deliveries *from* this user, newest first.
    pub async fn recent_comm_from(
        &self,
        side: Side,
        from_u: &str,
        limit: usize,
    ) -> Result<Vec<CommRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {COMM_COLS} FROM comm WHERE side = ?1 AND from_u = ?2 \
                     ORDER BY from_date DESC LIMIT ?3"
                ),
                params![side.as_db(), from_u, limit as i64],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(comm_from_row(&row)?);
        }
        Ok(out)
    }

    /// Deliveries from this user since `since` (rate-limit window).
    pub async fn count_comm_from_since(
        &self,
        side: Side,
        from_u: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM comm WHERE side = ?1 AND from_u = ?2 AND from_date > ?3",
                params![side.as_db(), from_u, encode_ts(since)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Drop correspondence rows of one side older than `cutoff`.
    pub async fn purge_comm_before(
        &self,
        side: Side,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let purged = conn
            .execute(
                "DELETE FROM comm WHERE side = ?1 AND from_date < ?2",
                params![side.as_db(), encode_ts(cutoff)],
            )
            .await?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(side: Side, name: &str) -> UserRow {
        UserRow {
            side,
            user: name.to_string(),
            req_date: None,
            nb_reg: 0,
            lang: "en".to_string(),
            revoke_date: None,
            app: "XMPP".to_string(),
            acc_id: "0".to_string(),
        }
    }

    fn comm(side: Side, user: &str, from_u: &str, at: DateTime<Utc>, id: u32) -> CommRow {
        CommRow {
            side,
            user: user.to_string(),
            from_u: from_u.to_string(),
            from_date: at,
            id_from: format!("f{id}"),
            id_to: format!("t{id}"),
        }
    }

    #[tokio::test]
    async fn user_lifecycle_roundtrip() {
        let store = BridgeStore::in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_user(&user(Side::Fedi, "a@fedi.example")).await.unwrap();
        store
            .activate_user(Side::Fedi, "a@fedi.example", 1, "fr", now)
            .await
            .unwrap();
        let row = store.user(Side::Fedi, "a@fedi.example").await.unwrap().unwrap();
        assert!(row.is_active());
        assert_eq!(row.nb_reg, 1);
        assert_eq!(row.lang, "fr");
        assert_eq!(row.req_date.unwrap(), decode_ts(&encode_ts(now)).unwrap());
        assert_eq!(row.domain(), "fedi.example");

        // Same (side, user) twice violates the primary key
        assert!(store.insert_user(&user(Side::Fedi, "a@fedi.example")).await.is_err());
        // Same address on the other side is a distinct row
        store.insert_user(&user(Side::Xmpp, "a@fedi.example")).await.unwrap();
    }

    #[tokio::test]
    async fn revoke_deletes_exactly_the_dependent_rows() {
        let store = BridgeStore::in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_user(&user(Side::Xmpp, "b@xmpp.example")).await.unwrap();
        store
            .activate_user(Side::Xmpp, "b@xmpp.example", 1, "en", now)
            .await
            .unwrap();

        store
            .add_block(Side::Xmpp, "b@xmpp.example", "evil@fedi.example", now)
            .await
            .unwrap();
        store
            .add_block(Side::Xmpp, "other@xmpp.example", "evil@fedi.example", now)
            .await
            .unwrap();
        // b as recipient (their side) and as sender (opposite side)
        store
            .add_comm(&comm(Side::Xmpp, "b@xmpp.example", "a@fedi.example", now, 1))
            .await
            .unwrap();
        store
            .add_comm(&comm(Side::Fedi, "a@fedi.example", "b@xmpp.example", now, 2))
            .await
            .unwrap();
        // unrelated delivery survives
        store
            .add_comm(&comm(Side::Fedi, "a@fedi.example", "c@xmpp.example", now, 3))
            .await
            .unwrap();

        store.revoke_user(Side::Xmpp, "b@xmpp.example", now).await.unwrap();

        let row = store.user(Side::Xmpp, "b@xmpp.example").await.unwrap().unwrap();
        assert!(!row.is_active());
        assert!(store.blocks_of(Side::Xmpp, "b@xmpp.example").await.unwrap().is_empty());
        assert_eq!(
            store.blocks_of(Side::Xmpp, "other@xmpp.example").await.unwrap().len(),
            1
        );
        assert!(store.last_comm_to(Side::Xmpp, "b@xmpp.example").await.unwrap().is_none());
        assert!(store
            .recent_comm_from(Side::Fedi, "b@xmpp.example", 10)
            .await
            .unwrap()
            .is_empty());
        // unrelated sender untouched
        assert_eq!(
            store.recent_comm_from(Side::Fedi, "c@xmpp.example", 10).await.unwrap().len(),
            1
        );
        assert!(store.last_comm_to(Side::Fedi, "a@fedi.example").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn comm_lookups_resolve_replies_and_fanouts() {
        let store = BridgeStore::in_memory().await.unwrap();
        let base = Utc::now() - Duration::minutes(10);
        // one XMPP->FEDI fan-out: same id_from, one row per recipient
        for (i, rcpt) in ["f1@fedi.example", "f2@fedi.example"].iter().enumerate() {
            store
                .add_comm(&CommRow {
                    side: Side::Fedi,
                    user: rcpt.to_string(),
                    from_u: "x@xmpp.example".to_string(),
                    from_date: base + Duration::seconds(i as i64),
                    id_from: "xm1".to_string(),
                    id_to: "st1".to_string(),
                })
                .await
                .unwrap();
        }

        let by_to = store.comm_by_id_to(Side::Fedi, "st1").await.unwrap().unwrap();
        assert_eq!(by_to.from_u, "x@xmpp.example");
        let fanout = store.comm_by_id_from(Side::Fedi, "xm1").await.unwrap();
        assert_eq!(fanout.len(), 2);

        let recent = store
            .recent_comm_from(Side::Fedi, "x@xmpp.example", 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user, "f2@fedi.example"); // newest first

        assert_eq!(
            store
                .count_comm_from_since(Side::Fedi, "x@xmpp.example", base - Duration::minutes(1))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count_comm_from_since(Side::Fedi, "x@xmpp.example", Utc::now())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn purge_respects_cutoff_and_side() {
        let store = BridgeStore::in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(40);
        let fresh = Utc::now();
        store.add_comm(&comm(Side::Xmpp, "b@x", "a@f", old, 1)).await.unwrap();
        store.add_comm(&comm(Side::Xmpp, "b@x", "a@f", fresh, 2)).await.unwrap();
        store.add_comm(&comm(Side::Fedi, "a@f", "b@x", old, 3)).await.unwrap();

        let purged = store
            .purge_comm_before(Side::Xmpp, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.comm_by_id_from(Side::Xmpp, "f2").await.unwrap().len() == 1);
        // other side untouched
        assert_eq!(store.comm_by_id_from(Side::Fedi, "f3").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn block_tables_enforce_their_keys() {
        let store = BridgeStore::in_memory().await.unwrap();
        let now = Utc::now();
        assert!(store.add_block(Side::Fedi, "a@f", "b@x", now).await.unwrap());
        assert!(!store.add_block(Side::Fedi, "a@f", "b@x", now).await.unwrap());
        assert!(store.has_block(Side::Fedi, "a@f", "b@x").await.unwrap());
        assert!(!store.has_block(Side::Xmpp, "a@f", "b@x").await.unwrap());
        assert!(store.del_block(Side::Fedi, "a@f", "b@x").await.unwrap());
        assert!(!store.del_block(Side::Fedi, "a@f", "b@x").await.unwrap());

        assert!(store.add_inst_block(Side::Xmpp, "evil@x", now).await.unwrap());
        assert!(!store.add_inst_block(Side::Xmpp, "evil@x", now).await.unwrap());
        assert!(store.has_inst_block(Side::Xmpp, "evil@x").await.unwrap());
        assert_eq!(store.inst_blocks().await.unwrap().len(), 1);
        assert!(store.del_inst_block(Side::Xmpp, "evil@x").await.unwrap());
    }

    #[tokio::test]
    async fn delete_user_removes_the_row_for_good() {
        let store = BridgeStore::in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_user(&user(Side::Fedi, "gone@f")).await.unwrap();
        store.activate_user(Side::Fedi, "gone@f", 1, "en", now).await.unwrap();
        store.revoke_user(Side::Fedi, "gone@f", now).await.unwrap();
        assert_eq!(store.revoked_users(Side::Fedi).await.unwrap().len(), 1);
        store.delete_user(Side::Fedi, "gone@f").await.unwrap();
        assert!(store.user(Side::Fedi, "gone@f").await.unwrap().is_none());
        assert!(store.revoked_users(Side::Fedi).await.unwrap().is_empty());
    }
}
