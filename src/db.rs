use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{Connection, params};

use crate::errors::{StoreError, StoreResult};
use crate::models::*;
use crate::output::predict_output;

/// Async-safe handle to the orders database.
///
/// Wraps `OrdersDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<OrdersDb>>,
}

impl DbHandle {
    pub fn new(db: OrdersDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&OrdersDb) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Behavior switches for the store.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// When set, line items may only be added, changed, or removed while
    /// the order is still a draft. Formed and completed orders keep their
    /// items frozen.
    pub draft_only_item_edits: bool,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            draft_only_item_edits: true,
        }
    }
}

pub struct OrdersDb {
    conn: Connection,
    pub policy: StorePolicy,
}

impl OrdersDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self {
            conn,
            policy: StorePolicy::default(),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing and `--dev`).
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            policy: StorePolicy::default(),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    login TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    is_moderator INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workshops (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    era TEXT NOT NULL DEFAULT '',
                    image_key TEXT NOT NULL DEFAULT '',
                    extra_image_key TEXT NOT NULL DEFAULT '',
                    is_deleted INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT NOT NULL DEFAULT 'draft',
                    created_at TEXT NOT NULL,
                    creator_id INTEGER NOT NULL REFERENCES users(id),
                    formed_at TEXT,
                    completed_at TEXT,
                    moderator_id INTEGER REFERENCES users(id),
                    production_name TEXT
                );

                CREATE TABLE IF NOT EXISTS order_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    workshop_id INTEGER NOT NULL REFERENCES workshops(id),
                    found_defects INTEGER NOT NULL DEFAULT 0,
                    predicted_output TEXT NOT NULL DEFAULT '',
                    UNIQUE(order_id, workshop_id)
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_one_draft_per_user
                    ON orders(creator_id) WHERE status = 'draft';
                CREATE INDEX IF NOT EXISTS idx_orders_creator ON orders(creator_id);
                CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── User CRUD ─────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        login: &str,
        password_hash: &str,
        is_moderator: bool,
    ) -> StoreResult<User> {
        match self.conn.execute(
            "INSERT INTO users (login, password_hash, is_moderator) VALUES (?1, ?2, ?3)",
            params![login, password_hash, is_moderator],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(format!(
                    "login '{}' is already taken",
                    login
                )));
            }
            Err(e) => Err(e).context("Failed to insert user")?,
        }
        let id = self.conn.last_insert_rowid();
        Ok(self.get_user(id)?.context("User not found after insert")?)
    }

    pub fn get_user(&self, id: i64) -> StoreResult<Option<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, login, password_hash, is_moderator FROM users WHERE id = ?1")
            .context("Failed to prepare get_user")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(User {
                    id: row.get(0)?,
                    login: row.get(1)?,
                    password_hash: row.get(2)?,
                    is_moderator: row.get::<_, i64>(3)? != 0,
                })
            })
            .context("Failed to query user")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read user row")?)),
            None => Ok(None),
        }
    }

    pub fn get_user_by_login(&self, login: &str) -> StoreResult<Option<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, login, password_hash, is_moderator FROM users WHERE login = ?1")
            .context("Failed to prepare get_user_by_login")?;
        let mut rows = stmt
            .query_map(params![login], |row| {
                Ok(User {
                    id: row.get(0)?,
                    login: row.get(1)?,
                    password_hash: row.get(2)?,
                    is_moderator: row.get::<_, i64>(3)? != 0,
                })
            })
            .context("Failed to query user by login")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read user row")?)),
            None => Ok(None),
        }
    }

    pub fn update_user(
        &self,
        id: i64,
        login: Option<&str>,
        password_hash: Option<&str>,
    ) -> StoreResult<User> {
        if self.get_user(id)?.is_none() {
            return Err(StoreError::NotFound(format!("user {}", id)));
        }

        // Safety: DbHandle's Mutex guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(l) = login {
            match tx.execute("UPDATE users SET login = ?1 WHERE id = ?2", params![l, id]) {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::Conflict(format!(
                        "login '{}' is already taken",
                        l
                    )));
                }
                Err(e) => Err(e).context("Failed to update user login")?,
            }
        }
        if let Some(p) = password_hash {
            tx.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![p, id],
            )
            .context("Failed to update user password")?;
        }
        tx.commit().context("Failed to commit user update")?;
        Ok(self.get_user(id)?.context("User not found after update")?)
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, token: &str, user_id: i64) -> StoreResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, now],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    /// Resolve a session token to its user, if the session exists.
    pub fn get_session_user(&self, token: &str) -> StoreResult<Option<User>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT u.id, u.login, u.password_hash, u.is_moderator
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1",
            )
            .context("Failed to prepare get_session_user")?;
        let mut rows = stmt
            .query_map(params![token], |row| {
                Ok(User {
                    id: row.get(0)?,
                    login: row.get(1)?,
                    password_hash: row.get(2)?,
                    is_moderator: row.get::<_, i64>(3)? != 0,
                })
            })
            .context("Failed to query session user")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read session user row")?)),
            None => Ok(None),
        }
    }

    /// Drop a session. Unknown tokens are a no-op, so logout is idempotent.
    pub fn delete_session(&self, token: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .context("Failed to delete session")?;
        Ok(())
    }

    // ── Workshop CRUD ─────────────────────────────────────────────────

    pub fn create_workshop(
        &self,
        name: &str,
        description: &str,
        era: &str,
    ) -> StoreResult<Workshop> {
        self.conn
            .execute(
                "INSERT INTO workshops (name, description, era) VALUES (?1, ?2, ?3)",
                params![name, description, era],
            )
            .context("Failed to insert workshop")?;
        let id = self.conn.last_insert_rowid();
        Ok(self
            .get_workshop(id)?
            .context("Workshop not found after insert")?)
    }

    /// Fetch a workshop by id. Soft-deleted rows are still returned here;
    /// only the catalogue listing filters them out.
    pub fn get_workshop(&self, id: i64) -> StoreResult<Option<Workshop>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, era, image_key, extra_image_key, is_deleted
                 FROM workshops WHERE id = ?1",
            )
            .context("Failed to prepare get_workshop")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(Workshop {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    era: row.get(3)?,
                    image_key: row.get(4)?,
                    extra_image_key: row.get(5)?,
                    is_deleted: row.get::<_, i64>(6)? != 0,
                })
            })
            .context("Failed to query workshop")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read workshop row")?)),
            None => Ok(None),
        }
    }

    /// List catalogue workshops, optionally filtered by a case-insensitive
    /// name substring. Soft-deleted rows are excluded.
    pub fn list_workshops(&self, name_filter: Option<&str>) -> StoreResult<Vec<WorkshopSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, era, image_key FROM workshops
                 WHERE is_deleted = 0 AND (?1 IS NULL OR name LIKE '%' || ?1 || '%')
                 ORDER BY id",
            )
            .context("Failed to prepare list_workshops")?;
        let rows = stmt
            .query_map(params![name_filter], |row| {
                Ok(WorkshopSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    era: row.get(2)?,
                    image_key: row.get(3)?,
                })
            })
            .context("Failed to query workshops")?;
        let mut workshops = Vec::new();
        for row in rows {
            workshops.push(row.context("Failed to read workshop row")?);
        }
        Ok(workshops)
    }

    /// Full replace of the editable workshop fields.
    pub fn update_workshop(
        &self,
        id: i64,
        name: &str,
        description: &str,
        era: &str,
    ) -> StoreResult<Workshop> {
        let count = self
            .conn
            .execute(
                "UPDATE workshops SET name = ?1, description = ?2, era = ?3 WHERE id = ?4",
                params![name, description, era, id],
            )
            .context("Failed to update workshop")?;
        if count == 0 {
            return Err(StoreError::NotFound(format!("workshop {}", id)));
        }
        Ok(self
            .get_workshop(id)?
            .context("Workshop not found after update")?)
    }

    /// Persist freshly stored image keys. Each slot is updated only when
    /// the corresponding argument is present.
    pub fn set_workshop_images(
        &self,
        id: i64,
        image_key: Option<&str>,
        extra_image_key: Option<&str>,
    ) -> StoreResult<Workshop> {
        if self.get_workshop(id)?.is_none() {
            return Err(StoreError::NotFound(format!("workshop {}", id)));
        }
        if let Some(key) = image_key {
            self.conn
                .execute(
                    "UPDATE workshops SET image_key = ?1 WHERE id = ?2",
                    params![key, id],
                )
                .context("Failed to set workshop image key")?;
        }
        if let Some(key) = extra_image_key {
            self.conn
                .execute(
                    "UPDATE workshops SET extra_image_key = ?1 WHERE id = ?2",
                    params![key, id],
                )
                .context("Failed to set workshop extra image key")?;
        }
        Ok(self
            .get_workshop(id)?
            .context("Workshop not found after image update")?)
    }

    /// Soft-delete a workshop. Returns the row as it was before the flag
    /// flip so the caller can purge its stored images.
    pub fn delete_workshop(&self, id: i64) -> StoreResult<Workshop> {
        let workshop = self
            .get_workshop(id)?
            .ok_or_else(|| StoreError::NotFound(format!("workshop {}", id)))?;
        self.conn
            .execute(
                "UPDATE workshops SET is_deleted = 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to delete workshop")?;
        Ok(workshop)
    }

    // ── Order lifecycle ───────────────────────────────────────────────

    /// Return the user's draft order, creating it first if none exists.
    ///
    /// The insert races safely against concurrent first requests: the
    /// partial unique index on `(creator_id) WHERE status = 'draft'` makes
    /// `ON CONFLICT DO NOTHING` a no-op for the loser, and both callers
    /// read back the same row.
    pub fn find_or_create_draft(&self, user_id: i64) -> StoreResult<Order> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO orders (status, created_at, creator_id) VALUES ('draft', ?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![now, user_id],
            )
            .context("Failed to create draft order")?;
        Ok(self
            .get_draft_for_user(user_id)?
            .context("Draft order not found after insert")?)
    }

    /// The user's current draft order, if any. Never creates one.
    pub fn get_draft_for_user(&self, user_id: i64) -> StoreResult<Option<Order>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, status, created_at, creator_id, formed_at, completed_at, moderator_id, production_name
                 FROM orders WHERE creator_id = ?1 AND status = 'draft'",
            )
            .context("Failed to prepare get_draft_for_user")?;
        let mut rows = stmt
            .query_map(params![user_id], order_row_from)
            .context("Failed to query draft order")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read order row")?;
                Ok(Some(r.into_order()?))
            }
            None => Ok(None),
        }
    }

    pub fn get_order(&self, id: i64) -> StoreResult<Option<Order>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, status, created_at, creator_id, formed_at, completed_at, moderator_id, production_name
                 FROM orders WHERE id = ?1",
            )
            .context("Failed to prepare get_order")?;
        let mut rows = stmt
            .query_map(params![id], order_row_from)
            .context("Failed to query order")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read order row")?;
                Ok(Some(r.into_order()?))
            }
            None => Ok(None),
        }
    }

    /// General order listing: drafts and deleted orders never appear, even
    /// when the status filter names them. Date bounds apply to `formed_at`
    /// inclusively at day granularity.
    pub fn list_orders(
        &self,
        status: Option<OrderStatus>,
        date_from: Option<chrono::NaiveDate>,
        date_to: Option<chrono::NaiveDate>,
    ) -> StoreResult<Vec<OrderSummary>> {
        let status_token = status.map(|s| s.as_str().to_string());
        let from_bound = date_from.map(|d| d.format("%Y-%m-%d").to_string());
        let to_bound = match date_to {
            Some(d) => Some(
                d.succ_opt()
                    .ok_or_else(|| StoreError::BadRequest("date_to is out of range".to_string()))?
                    .format("%Y-%m-%d")
                    .to_string(),
            ),
            None => None,
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT o.id, o.status, o.created_at, u.login,
                        (SELECT COUNT(*) FROM order_items oi
                          WHERE oi.order_id = o.id AND oi.predicted_output <> '')
                 FROM orders o JOIN users u ON u.id = o.creator_id
                 WHERE o.status NOT IN ('draft', 'deleted')
                   AND (?1 IS NULL OR o.status = ?1)
                   AND (?2 IS NULL OR o.formed_at >= ?2)
                   AND (?3 IS NULL OR o.formed_at < ?3)
                 ORDER BY o.id",
            )
            .context("Failed to prepare list_orders")?;
        let rows = stmt
            .query_map(params![status_token, from_bound, to_bound], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("Failed to query orders")?;

        let mut orders = Vec::new();
        for row in rows {
            let (id, status_str, created_at, creator_login, completed_items_count) =
                row.context("Failed to read order row")?;
            let status = OrderStatus::from_str(&status_str)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse order status")?;
            orders.push(OrderSummary {
                id,
                status,
                created_at,
                creator_login,
                completed_items_count,
            });
        }
        Ok(orders)
    }

    /// Full order view for its creator or a moderator. Anyone else gets
    /// `NotFound`, indistinguishable from a missing order.
    pub fn get_order_detail(&self, order_id: i64, viewer: &User) -> StoreResult<OrderDetail> {
        let order = self
            .get_order(order_id)?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.creator_id != viewer.id && !viewer.is_moderator {
            return Err(StoreError::NotFound(format!("order {}", order_id)));
        }

        let creator_login: String = self
            .conn
            .query_row(
                "SELECT login FROM users WHERE id = ?1",
                params![order.creator_id],
                |row| row.get(0),
            )
            .context("Failed to resolve creator login")?;
        let moderator_login: Option<String> = match order.moderator_id {
            Some(mid) => Some(
                self.conn
                    .query_row(
                        "SELECT login FROM users WHERE id = ?1",
                        params![mid],
                        |row| row.get(0),
                    )
                    .context("Failed to resolve moderator login")?,
            ),
            None => None,
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT w.id, w.name, w.era, oi.found_defects, oi.predicted_output
                 FROM order_items oi JOIN workshops w ON w.id = oi.workshop_id
                 WHERE oi.order_id = ?1 ORDER BY oi.id",
            )
            .context("Failed to prepare order items")?;
        let rows = stmt
            .query_map(params![order_id], |row| {
                Ok(OrderDetailItem {
                    workshop: WorkshopRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        era: row.get(2)?,
                    },
                    found_defects: row.get(3)?,
                    predicted_output: row.get(4)?,
                })
            })
            .context("Failed to query order items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read order item row")?);
        }

        Ok(OrderDetail {
            id: order.id,
            status: order.status,
            created_at: order.created_at,
            creator_login,
            production_name: order.production_name,
            formed_at: order.formed_at,
            completed_at: order.completed_at,
            moderator_login,
            items,
        })
    }

    /// Rename a draft order. Only its creator may do so, and only while
    /// the order is still a draft.
    pub fn rename_order(&self, order_id: i64, actor_id: i64, name: &str) -> StoreResult<Order> {
        let order = self
            .get_order(order_id)?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.creator_id != actor_id || order.status != OrderStatus::Draft {
            return Err(StoreError::Forbidden(
                "only the creator may rename a draft order".to_string(),
            ));
        }
        self.conn
            .execute(
                "UPDATE orders SET production_name = ?1 WHERE id = ?2",
                params![name, order_id],
            )
            .context("Failed to rename order")?;
        Ok(self
            .get_order(order_id)?
            .context("Order not found after rename")?)
    }

    /// Transition the creator's draft to `formed`. Empty orders cannot be
    /// formed.
    pub fn form_order(&self, order_id: i64, actor_id: i64) -> StoreResult<Order> {
        let order = self
            .get_order(order_id)?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.creator_id != actor_id || order.status != OrderStatus::Draft {
            return Err(StoreError::Forbidden(
                "only the creator may form a draft order".to_string(),
            ));
        }
        if self.count_order_items(order_id)? == 0 {
            return Err(StoreError::BadRequest(
                "order has no line items".to_string(),
            ));
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE orders SET status = 'formed', formed_at = ?1 WHERE id = ?2",
                params![now, order_id],
            )
            .context("Failed to form order")?;
        Ok(self
            .get_order(order_id)?
            .context("Order not found after forming")?)
    }

    /// Complete a formed order: recompute every line item's predicted
    /// output and flip the status, all in one transaction. A failure
    /// anywhere rolls the whole transition back and the order stays
    /// `formed`.
    pub fn complete_order(&self, order_id: i64, moderator_id: i64) -> StoreResult<Order> {
        let order = self
            .get_order(order_id)?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.status != OrderStatus::Formed {
            return Err(StoreError::Forbidden(
                "only formed orders can be completed".to_string(),
            ));
        }

        // Safety: DbHandle's Mutex guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare("SELECT id, found_defects FROM order_items WHERE order_id = ?1")
                .context("Failed to prepare item recompute")?;
            let rows = stmt
                .query_map(params![order_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .context("Failed to query order items")?;
            for row in rows {
                let (item_id, found_defects) = row.context("Failed to read order item row")?;
                tx.execute(
                    "UPDATE order_items SET predicted_output = ?1 WHERE id = ?2",
                    params![predict_output(found_defects), item_id],
                )
                .context("Failed to write predicted output")?;
            }
        }
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE orders SET status = 'completed', completed_at = ?1, moderator_id = ?2 WHERE id = ?3",
            params![now, moderator_id, order_id],
        )
        .context("Failed to complete order")?;
        tx.commit().context("Failed to commit order completion")?;

        Ok(self
            .get_order(order_id)?
            .context("Order not found after completion")?)
    }

    /// Logical delete. The WHERE clause filters on id and creator only, so
    /// an order belonging to someone else reports `NotFound` and repeated
    /// deletes of one's own order are idempotent.
    pub fn delete_order(&self, order_id: i64, actor_id: i64) -> StoreResult<()> {
        let count = self
            .conn
            .execute(
                "UPDATE orders SET status = 'deleted' WHERE id = ?1 AND creator_id = ?2",
                params![order_id, actor_id],
            )
            .context("Failed to delete order")?;
        if count == 0 {
            return Err(StoreError::NotFound(format!("order {}", order_id)));
        }
        Ok(())
    }

    // ── Line items ────────────────────────────────────────────────────

    /// Add a workshop to an order. Missing and soft-deleted workshops are
    /// both `NotFound`; a repeated (order, workshop) pair is `Conflict`.
    pub fn add_item(&self, order_id: i64, workshop_id: i64) -> StoreResult<OrderItem> {
        match self.get_workshop(workshop_id)? {
            Some(w) if !w.is_deleted => {}
            _ => return Err(StoreError::NotFound(format!("workshop {}", workshop_id))),
        }
        match self.conn.execute(
            "INSERT INTO order_items (order_id, workshop_id) VALUES (?1, ?2)",
            params![order_id, workshop_id],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(format!(
                    "workshop {} is already in order {}",
                    workshop_id, order_id
                )));
            }
            Err(e) => Err(e).context("Failed to insert order item")?,
        }
        let id = self.conn.last_insert_rowid();
        Ok(self
            .get_item(id)?
            .context("Order item not found after insert")?)
    }

    pub fn update_item(
        &self,
        order_id: i64,
        workshop_id: i64,
        found_defects: i64,
    ) -> StoreResult<OrderItem> {
        self.assert_items_editable(order_id)?;
        let count = self
            .conn
            .execute(
                "UPDATE order_items SET found_defects = ?1 WHERE order_id = ?2 AND workshop_id = ?3",
                params![found_defects, order_id, workshop_id],
            )
            .context("Failed to update order item")?;
        if count == 0 {
            return Err(StoreError::NotFound(format!(
                "line item for workshop {} in order {}",
                workshop_id, order_id
            )));
        }
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, order_id, workshop_id, found_defects, predicted_output
                 FROM order_items WHERE order_id = ?1 AND workshop_id = ?2",
            )
            .context("Failed to prepare item lookup")?;
        let item = stmt
            .query_row(params![order_id, workshop_id], item_row_from)
            .context("Order item not found after update")?;
        Ok(item)
    }

    pub fn remove_item(&self, order_id: i64, workshop_id: i64) -> StoreResult<()> {
        self.assert_items_editable(order_id)?;
        let count = self
            .conn
            .execute(
                "DELETE FROM order_items WHERE order_id = ?1 AND workshop_id = ?2",
                params![order_id, workshop_id],
            )
            .context("Failed to delete order item")?;
        if count == 0 {
            return Err(StoreError::NotFound(format!(
                "line item for workshop {} in order {}",
                workshop_id, order_id
            )));
        }
        Ok(())
    }

    pub fn count_order_items(&self, order_id: i64) -> StoreResult<i64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM order_items WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .context("Failed to count order items")?;
        Ok(count)
    }

    fn get_item(&self, id: i64) -> StoreResult<Option<OrderItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, order_id, workshop_id, found_defects, predicted_output
                 FROM order_items WHERE id = ?1",
            )
            .context("Failed to prepare get_item")?;
        let mut rows = stmt
            .query_map(params![id], item_row_from)
            .context("Failed to query order item")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read order item row")?)),
            None => Ok(None),
        }
    }

    fn assert_items_editable(&self, order_id: i64) -> StoreResult<()> {
        if !self.policy.draft_only_item_edits {
            return Ok(());
        }
        let order = self
            .get_order(order_id)?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.status != OrderStatus::Draft {
            return Err(StoreError::Forbidden(
                "line items can only be changed while the order is a draft".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading orders from SQLite before the
/// status string is parsed into `OrderStatus`.
struct OrderRow {
    id: i64,
    status: String,
    created_at: String,
    creator_id: i64,
    formed_at: Option<String>,
    completed_at: Option<String>,
    moderator_id: Option<i64>,
    production_name: Option<String>,
}

fn order_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        id: row.get(0)?,
        status: row.get(1)?,
        created_at: row.get(2)?,
        creator_id: row.get(3)?,
        formed_at: row.get(4)?,
        completed_at: row.get(5)?,
        moderator_id: row.get(6)?,
        production_name: row.get(7)?,
    })
}

impl OrderRow {
    fn into_order(self) -> StoreResult<Order> {
        let status = OrderStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse order status")?;
        Ok(Order {
            id: self.id,
            status,
            created_at: self.created_at,
            creator_id: self.creator_id,
            formed_at: self.formed_at,
            completed_at: self.completed_at,
            moderator_id: self.moderator_id,
            production_name: self.production_name,
        })
    }
}

fn item_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        workshop_id: row.get(2)?,
        found_defects: row.get(3)?,
        predicted_output: row.get(4)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    ) && err.to_string().contains("UNIQUE")
}

// ── Tests ─────────────────────────────────────────────────────────────
