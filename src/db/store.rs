//! Persistence.
//!
//! A relational store with transactional writes: a single
//! `rusqlite::Connection` behind a `parking_lot::Mutex`, `prepare_cached` for
//! hot queries, explicit `BEGIN IMMEDIATE`/`COMMIT` for multi-row writes.
//! Row-scoped reads return at most one row; write operations return
//! `{last_inserted_id, rows_changed}` via `WriteResult`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::*;

use super::schema::SCHEMA_SQL;

#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    pub last_inserted_id: i64,
    pub rows_changed: usize,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode, "WAL mode not active");
        }

        info!(db_path, "persistence initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---------------------------------------------------------------- instances

    pub fn create_instance(&self, i: &Instance) -> Result<Instance> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instances
                (name, host_url, api_key, strategy_tag, target_profit, target_loss,
                 is_active, is_analyzer_mode, order_placement_disabled, health_status,
                 last_health_check, current_balance, realized_pnl, unrealized_pnl,
                 total_pnl, market_data_role, last_updated)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                i.name,
                i.host_url,
                i.api_key,
                i.strategy_tag,
                i.target_profit,
                i.target_loss,
                i.is_active,
                i.is_analyzer_mode,
                i.order_placement_disabled,
                i.health_status.as_str(),
                i.last_health_check.as_ref().map(fmt_dt),
                i.current_balance,
                i.realized_pnl,
                i.unrealized_pnl,
                i.total_pnl,
                i.market_data_role.as_str(),
                fmt_dt(&i.last_updated),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                anyhow::anyhow!("an instance with host_url {} already exists", i.host_url)
            }
            other => other.into(),
        })?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_instance(id)?
            .context("instance vanished immediately after insert")
    }

    fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
        let health_status: String = row.get("health_status")?;
        let market_data_role: String = row.get("market_data_role")?;
        let last_health_check: Option<String> = row.get("last_health_check")?;
        let last_updated: String = row.get("last_updated")?;
        Ok(Instance {
            id: row.get("id")?,
            name: row.get("name")?,
            host_url: row.get("host_url")?,
            api_key: row.get("api_key")?,
            strategy_tag: row.get("strategy_tag")?,
            target_profit: row.get("target_profit")?,
            target_loss: row.get("target_loss")?,
            is_active: row.get("is_active")?,
            is_analyzer_mode: row.get("is_analyzer_mode")?,
            order_placement_disabled: row.get("order_placement_disabled")?,
            health_status: HealthStatus::from_str(&health_status),
            last_health_check: last_health_check.map(|s| parse_dt(&s)),
            current_balance: row.get("current_balance")?,
            realized_pnl: row.get("realized_pnl")?,
            unrealized_pnl: row.get("unrealized_pnl")?,
            total_pnl: row.get("total_pnl")?,
            market_data_role: MarketDataRole::from_str(&market_data_role),
            last_updated: parse_dt(&last_updated),
        })
    }

    pub fn get_instance(&self, id: i64) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM instances WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        Ok(match rows.next()? {
            Some(row) => Some(Self::row_to_instance(row)?),
            None => None,
        })
    }

    pub fn list_instances(&self, is_active: Option<bool>) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match is_active {
            Some(flag) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM instances WHERE is_active = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(params![flag])?;
                while let Some(row) = rows.next()? {
                    out.push(Self::row_to_instance(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached("SELECT * FROM instances ORDER BY id")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(Self::row_to_instance(row)?);
                }
            }
        }
        Ok(out)
    }

    pub fn update_instance(&self, i: &Instance) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE instances SET
                name=?2, host_url=?3, api_key=?4, strategy_tag=?5, target_profit=?6,
                target_loss=?7, is_active=?8, is_analyzer_mode=?9, order_placement_disabled=?10,
                health_status=?11, last_health_check=?12, current_balance=?13, realized_pnl=?14,
                unrealized_pnl=?15, total_pnl=?16, market_data_role=?17, last_updated=?18
             WHERE id=?1",
            params![
                i.id,
                i.name,
                i.host_url,
                i.api_key,
                i.strategy_tag,
                i.target_profit,
                i.target_loss,
                i.is_active,
                i.is_analyzer_mode,
                i.order_placement_disabled,
                i.health_status.as_str(),
                i.last_health_check.as_ref().map(fmt_dt),
                i.current_balance,
                i.realized_pnl,
                i.unrealized_pnl,
                i.total_pnl,
                i.market_data_role.as_str(),
                fmt_dt(&i.last_updated),
            ],
        )?;
        Ok(())
    }

    pub fn update_instance_health(
        &self,
        id: i64,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
        set_active: Option<bool>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        if let Some(active) = set_active {
            conn.execute(
                "UPDATE instances SET health_status=?2, last_health_check=?3, is_active=?4, last_updated=?3 WHERE id=?1",
                params![id, status.as_str(), fmt_dt(&checked_at), active],
            )?;
        } else {
            conn.execute(
                "UPDATE instances SET health_status=?2, last_health_check=?3, last_updated=?3 WHERE id=?1",
                params![id, status.as_str(), fmt_dt(&checked_at)],
            )?;
        }
        Ok(())
    }

    pub fn update_instance_pnl(
        &self,
        id: i64,
        balance: f64,
        realized: f64,
        unrealized: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let total = realized + unrealized;
        conn.execute(
            "UPDATE instances SET current_balance=?2, realized_pnl=?3, unrealized_pnl=?4,
             total_pnl=?5, last_updated=?6 WHERE id=?1",
            params![id, balance, realized, unrealized, total, fmt_dt(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn set_instance_analyzer_mode(&self, id: i64, is_analyzer_mode: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE instances SET is_analyzer_mode=?2, last_updated=?3 WHERE id=?1",
            params![id, is_analyzer_mode, fmt_dt(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn delete_instance(&self, id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM instances WHERE id=?1", params![id])?)
    }

    // --------------------------------------------------------------- watchlists

    pub fn create_watchlist(&self, w: &Watchlist) -> Result<Watchlist> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watchlists (name, description, is_active) VALUES (?1,?2,?3)",
            params![w.name, w.description, w.is_active],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Watchlist { id, ..w.clone() })
    }

    fn row_to_watchlist(row: &Row) -> rusqlite::Result<Watchlist> {
        Ok(Watchlist {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            is_active: row.get("is_active")?,
        })
    }

    pub fn get_watchlist(&self, id: i64) -> Result<Option<Watchlist>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM watchlists WHERE id=?1")?;
        let mut rows = stmt.query(params![id])?;
        Ok(match rows.next()? {
            Some(row) => Some(Self::row_to_watchlist(row)?),
            None => None,
        })
    }

    pub fn list_watchlists(&self) -> Result<Vec<Watchlist>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM watchlists ORDER BY id")?;
        let rows = stmt
            .query_map([], Self::row_to_watchlist)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn update_watchlist(&self, w: &Watchlist) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE watchlists SET name=?2, description=?3, is_active=?4 WHERE id=?1",
            params![w.id, w.name, w.description, w.is_active],
        )?;
        Ok(())
    }

    pub fn delete_watchlist(&self, id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM watchlists WHERE id=?1", params![id])?)
    }

    /// Clone a watchlist and its symbols (not its instance bindings or
    /// order/position history) under a new name.
    pub fn clone_watchlist(&self, source_id: i64, new_name: &str) -> Result<Watchlist> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let (description, is_active): (Option<String>, bool) = tx.query_row(
            "SELECT description, is_active FROM watchlists WHERE id=?1",
            params![source_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        tx.execute(
            "INSERT INTO watchlists (name, description, is_active) VALUES (?1,?2,?3)",
            params![new_name, description, is_active],
        )?;
        let new_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO watchlist_symbols
                (watchlist_id, exchange, symbol, token, lot_size, qty_mode, qty_value,
                 qty_units, min_qty_per_click, max_qty_per_click, capital_ceiling_per_trade,
                 contract_multiplier, rounding, product_type, order_type, can_trade_equity,
                 can_trade_futures, can_trade_options, options_strike_offset,
                 options_expiry_mode, target_type, target_value, sl_type, sl_value,
                 ts_type, ts_value, trailing_activation_type, trailing_activation_value,
                 max_position_size, max_instances, is_enabled)
             SELECT ?2, exchange, symbol, token, lot_size, qty_mode, qty_value,
                 qty_units, min_qty_per_click, max_qty_per_click, capital_ceiling_per_trade,
                 contract_multiplier, rounding, product_type, order_type, can_trade_equity,
                 can_trade_futures, can_trade_options, options_strike_offset,
                 options_expiry_mode, target_type, target_value, sl_type, sl_value,
                 ts_type, ts_value, trailing_activation_type, trailing_activation_value,
                 max_position_size, max_instances, is_enabled
             FROM watchlist_symbols WHERE watchlist_id=?1",
            params![source_id, new_id],
        )?;

        tx.commit()?;
        drop(conn);
        self.get_watchlist(new_id)?
            .context("cloned watchlist vanished immediately after insert")
    }

    // ---------------------------------------------------------- watchlist symbols

    fn row_to_symbol(row: &Row) -> rusqlite::Result<WatchlistSymbol> {
        let qty_mode: String = row.get("qty_mode")?;
        let qty_units: Option<String> = row.get("qty_units")?;
        let rounding: String = row.get("rounding")?;
        let product_type: String = row.get("product_type")?;
        let order_type: String = row.get("order_type")?;
        let options_strike_offset: Option<String> = row.get("options_strike_offset")?;
        let target_type: String = row.get("target_type")?;
        let sl_type: String = row.get("sl_type")?;
        let ts_type: String = row.get("ts_type")?;
        let trailing_activation_type: String = row.get("trailing_activation_type")?;

        Ok(WatchlistSymbol {
            id: row.get("id")?,
            watchlist_id: row.get("watchlist_id")?,
            exchange: row.get("exchange")?,
            symbol: row.get("symbol")?,
            token: row.get("token")?,
            lot_size: row.get("lot_size")?,
            qty_mode: QtyMode::from_str(&qty_mode).unwrap_or(QtyMode::Fixed),
            qty_value: row.get("qty_value")?,
            qty_units: qty_units.and_then(|s| QtyUnits::from_str(&s)),
            min_qty_per_click: row.get("min_qty_per_click")?,
            max_qty_per_click: row.get("max_qty_per_click")?,
            capital_ceiling_per_trade: row.get("capital_ceiling_per_trade")?,
            contract_multiplier: row.get("contract_multiplier")?,
            rounding: Rounding::from_str(&rounding).unwrap_or(Rounding::FloorToLot),
            product_type: ProductType::from_str(&product_type).unwrap_or(ProductType::Mis),
            order_type: OrderType::from_str(&order_type).unwrap_or(OrderType::Market),
            can_trade_equity: row.get("can_trade_equity")?,
            can_trade_futures: row.get("can_trade_futures")?,
            can_trade_options: row.get("can_trade_options")?,
            options_strike_offset: options_strike_offset
                .and_then(|s| OptionsStrikeOffset::from_str(&s)),
            options_expiry_mode: row.get("options_expiry_mode")?,
            target_type: TargetType::from_str(&target_type).unwrap_or(TargetType::None),
            target_value: row.get("target_value")?,
            sl_type: TargetType::from_str(&sl_type).unwrap_or(TargetType::None),
            sl_value: row.get("sl_value")?,
            ts_type: TargetType::from_str(&ts_type).unwrap_or(TargetType::None),
            ts_value: row.get("ts_value")?,
            trailing_activation_type: TrailingActivationType::from_str(&trailing_activation_type)
                .unwrap_or(TrailingActivationType::Immediate),
            trailing_activation_value: row.get("trailing_activation_value")?,
            max_position_size: row.get("max_position_size")?,
            max_instances: row.get("max_instances")?,
            is_enabled: row.get("is_enabled")?,
        })
    }

    pub fn create_symbol(&self, s: &WatchlistSymbol) -> Result<WatchlistSymbol> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watchlist_symbols
                (watchlist_id, exchange, symbol, token, lot_size, qty_mode, qty_value,
                 qty_units, min_qty_per_click, max_qty_per_click, capital_ceiling_per_trade,
                 contract_multiplier, rounding, product_type, order_type, can_trade_equity,
                 can_trade_futures, can_trade_options, options_strike_offset,
                 options_expiry_mode, target_type, target_value, sl_type, sl_value,
                 ts_type, ts_value, trailing_activation_type, trailing_activation_value,
                 max_position_size, max_instances, is_enabled)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,
                     ?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31)",
            params![
                s.watchlist_id,
                s.exchange,
                s.symbol,
                s.token,
                s.lot_size,
                s.qty_mode.as_str(),
                s.qty_value,
                s.qty_units.map(|u| u.as_str()),
                s.min_qty_per_click,
                s.max_qty_per_click,
                s.capital_ceiling_per_trade,
                s.contract_multiplier,
                s.rounding.as_str(),
                s.product_type.as_str(),
                s.order_type.as_str(),
                s.can_trade_equity,
                s.can_trade_futures,
                s.can_trade_options,
                s.options_strike_offset.map(|o| o.as_str()),
                s.options_expiry_mode,
                s.target_type.as_str(),
                s.target_value,
                s.sl_type.as_str(),
                s.sl_value,
                s.ts_type.as_str(),
                s.ts_value,
                s.trailing_activation_type.as_str(),
                s.trailing_activation_value,
                s.max_position_size,
                s.max_instances,
                s.is_enabled,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(WatchlistSymbol { id, ..s.clone() })
    }

    pub fn get_symbol(&self, id: i64) -> Result<Option<WatchlistSymbol>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM watchlist_symbols WHERE id=?1")?;
        let mut rows = stmt.query(params![id])?;
        Ok(match rows.next()? {
            Some(row) => Some(Self::row_to_symbol(row)?),
            None => None,
        })
    }

    pub fn list_symbols(&self, watchlist_id: i64) -> Result<Vec<WatchlistSymbol>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM watchlist_symbols WHERE watchlist_id=?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![watchlist_id], Self::row_to_symbol)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_symbol(&self, id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM watchlist_symbols WHERE id=?1", params![id])?)
    }

    // -------------------------------------------------------------------- bindings

    pub fn bind_instances(&self, watchlist_id: i64, instance_ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock();
        for instance_id in instance_ids {
            conn.execute(
                "INSERT OR IGNORE INTO watchlist_instances (watchlist_id, instance_id) VALUES (?1,?2)",
                params![watchlist_id, instance_id],
            )?;
        }
        Ok(())
    }

    pub fn unbind_instances(&self, watchlist_id: i64, instance_ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock();
        for instance_id in instance_ids {
            conn.execute(
                "DELETE FROM watchlist_instances WHERE watchlist_id=?1 AND instance_id=?2",
                params![watchlist_id, instance_id],
            )?;
        }
        Ok(())
    }

    pub fn list_bound_instances(&self, watchlist_id: i64) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT i.* FROM instances i
             JOIN watchlist_instances wi ON wi.instance_id = i.id
             WHERE wi.watchlist_id = ?1
             ORDER BY i.id",
        )?;
        let rows = stmt
            .query_map(params![watchlist_id], Self::row_to_instance)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // --------------------------------------------------------------------- orders

    fn row_to_order(row: &Row) -> rusqlite::Result<WatchlistOrder> {
        let action: String = row.get("action")?;
        let order_type: String = row.get("order_type")?;
        let product_type: String = row.get("product_type")?;
        let status: String = row.get("status")?;
        let placed_at: String = row.get("placed_at")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(WatchlistOrder {
            id: row.get("id")?,
            watchlist_id: row.get("watchlist_id")?,
            instance_id: row.get("instance_id")?,
            symbol_id: row.get("symbol_id")?,
            action: OrderAction::from_str(&action).unwrap_or(OrderAction::Buy),
            quantity: row.get("quantity")?,
            order_type: OrderType::from_str(&order_type).unwrap_or(OrderType::Market),
            product_type: ProductType::from_str(&product_type).unwrap_or(ProductType::Mis),
            price: row.get("price")?,
            trigger_price: row.get("trigger_price")?,
            status: OrderStatus::from_str(&status).unwrap_or(OrderStatus::Pending),
            order_id: row.get("order_id")?,
            filled_quantity: row.get("filled_quantity")?,
            average_price: row.get("average_price")?,
            position_id: row.get("position_id")?,
            message: row.get("message")?,
            placed_at: parse_dt(&placed_at),
            updated_at: parse_dt(&updated_at),
        })
    }

    pub fn create_order(&self, o: &WatchlistOrder) -> Result<WatchlistOrder> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watchlist_orders
                (watchlist_id, instance_id, symbol_id, action, quantity, order_type,
                 product_type, price, trigger_price, status, order_id, filled_quantity,
                 average_price, position_id, message, placed_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                o.watchlist_id,
                o.instance_id,
                o.symbol_id,
                o.action.as_str(),
                o.quantity,
                o.order_type.as_str(),
                o.product_type.as_str(),
                o.price,
                o.trigger_price,
                o.status.as_str(),
                o.order_id,
                o.filled_quantity,
                o.average_price,
                o.position_id,
                o.message,
                fmt_dt(&o.placed_at),
                fmt_dt(&o.updated_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(WatchlistOrder { id, ..o.clone() })
    }

    pub fn get_order(&self, id: i64) -> Result<Option<WatchlistOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM watchlist_orders WHERE id=?1")?;
        let mut rows = stmt.query(params![id])?;
        Ok(match rows.next()? {
            Some(row) => Some(Self::row_to_order(row)?),
            None => None,
        })
    }

    pub fn update_order(&self, o: &WatchlistOrder) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE watchlist_orders SET status=?2, order_id=?3, filled_quantity=?4,
             average_price=?5, position_id=?6, message=?7, updated_at=?8 WHERE id=?1",
            params![
                o.id,
                o.status.as_str(),
                o.order_id,
                o.filled_quantity,
                o.average_price,
                o.position_id,
                o.message,
                fmt_dt(&o.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_orders(
        &self,
        status: Option<OrderStatus>,
        instance_id: Option<i64>,
    ) -> Result<Vec<WatchlistOrder>> {
        let conn = self.conn.lock();
        let mut sql = "SELECT * FROM watchlist_orders WHERE 1=1".to_string();
        if status.is_some() {
            sql.push_str(" AND status = ?1");
        }
        if instance_id.is_some() {
            sql.push_str(if status.is_some() {
                " AND instance_id = ?2"
            } else {
                " AND instance_id = ?1"
            });
        }
        sql.push_str(" ORDER BY placed_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<WatchlistOrder> = match (status, instance_id) {
            (Some(s), Some(iid)) => stmt
                .query_map(params![s.as_str(), iid], Self::row_to_order)?
                .filter_map(|r| r.ok())
                .collect(),
            (Some(s), None) => stmt
                .query_map(params![s.as_str()], Self::row_to_order)?
                .filter_map(|r| r.ok())
                .collect(),
            (None, Some(iid)) => stmt
                .query_map(params![iid], Self::row_to_order)?
                .filter_map(|r| r.ok())
                .collect(),
            (None, None) => stmt
                .query_map([], Self::row_to_order)?
                .filter_map(|r| r.ok())
                .collect(),
        };
        Ok(rows)
    }

    /// Non-terminal orders grouped by `instance_id`, used by the reconciler
    /// to drive one `orderbook` call per instance.
    pub fn list_open_orders_by_instance(&self, instance_id: i64) -> Result<Vec<WatchlistOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM watchlist_orders
             WHERE instance_id = ?1 AND status IN ('pending','open')
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![instance_id], Self::row_to_order)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn distinct_instance_ids_with_open_orders(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT instance_id FROM watchlist_orders WHERE status IN ('pending','open')",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ----------------------------------------------------------------- positions

    fn row_to_position(row: &Row) -> rusqlite::Result<WatchlistPosition> {
        let direction: String = row.get("direction")?;
        let status: String = row.get("status")?;
        let exit_reason: Option<String> = row.get("exit_reason")?;
        let entered_at: String = row.get("entered_at")?;
        let exited_at: Option<String> = row.get("exited_at")?;
        Ok(WatchlistPosition {
            id: row.get("id")?,
            watchlist_id: row.get("watchlist_id")?,
            instance_id: row.get("instance_id")?,
            symbol_id: row.get("symbol_id")?,
            direction: if direction == "SHORT" {
                Direction::Short
            } else {
                Direction::Long
            },
            quantity: row.get("quantity")?,
            entry_price: row.get("entry_price")?,
            current_price: row.get("current_price")?,
            exit_price: row.get("exit_price")?,
            target_price: row.get("target_price")?,
            sl_price: row.get("sl_price")?,
            trailing_stop_price: row.get("trailing_stop_price")?,
            trailing_activated: row.get("trailing_activated")?,
            highest_price_seen: row.get("highest_price_seen")?,
            lowest_price_seen: row.get("lowest_price_seen")?,
            status: match status.as_str() {
                "OPEN" => PositionStatus::Open,
                "CLOSED" => PositionStatus::Closed,
                "FAILED" => PositionStatus::Failed,
                _ => PositionStatus::Pending,
            },
            is_closed: row.get("is_closed")?,
            exit_reason: exit_reason.and_then(|s| match s.as_str() {
                "MANUAL" => Some(ExitReason::Manual),
                "TARGET_HIT" => Some(ExitReason::TargetHit),
                "STOP_LOSS" => Some(ExitReason::StopLoss),
                "TRAILING_STOP" => Some(ExitReason::TrailingStop),
                "ORDER_REJECTED" => Some(ExitReason::OrderRejected),
                "SYSTEM_AUTO" => Some(ExitReason::SystemAuto),
                _ => None,
            }),
            entered_at: parse_dt(&entered_at),
            exited_at: exited_at.map(|s| parse_dt(&s)),
        })
    }

    fn exit_reason_str(r: ExitReason) -> &'static str {
        match r {
            ExitReason::Manual => "MANUAL",
            ExitReason::TargetHit => "TARGET_HIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::OrderRejected => "ORDER_REJECTED",
            ExitReason::SystemAuto => "SYSTEM_AUTO",
        }
    }

    fn status_str(s: PositionStatus) -> &'static str {
        match s {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Failed => "FAILED",
        }
    }

    pub fn create_position(&self, p: &WatchlistPosition) -> Result<WatchlistPosition> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watchlist_positions
                (watchlist_id, instance_id, symbol_id, direction, quantity, entry_price,
                 current_price, exit_price, target_price, sl_price, trailing_stop_price,
                 trailing_activated, highest_price_seen, lowest_price_seen, status,
                 is_closed, exit_reason, entered_at, exited_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            params![
                p.watchlist_id,
                p.instance_id,
                p.symbol_id,
                if p.direction == Direction::Short { "SHORT" } else { "LONG" },
                p.quantity,
                p.entry_price,
                p.current_price,
                p.exit_price,
                p.target_price,
                p.sl_price,
                p.trailing_stop_price,
                p.trailing_activated,
                p.highest_price_seen,
                p.lowest_price_seen,
                Self::status_str(p.status),
                p.is_closed,
                p.exit_reason.map(Self::exit_reason_str),
                fmt_dt(&p.entered_at),
                p.exited_at.as_ref().map(fmt_dt),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(WatchlistPosition { id, ..p.clone() })
    }

    pub fn get_position(&self, id: i64) -> Result<Option<WatchlistPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM watchlist_positions WHERE id=?1")?;
        let mut rows = stmt.query(params![id])?;
        Ok(match rows.next()? {
            Some(row) => Some(Self::row_to_position(row)?),
            None => None,
        })
    }

    pub fn update_position(&self, p: &WatchlistPosition) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE watchlist_positions SET direction=?2, quantity=?3, entry_price=?4,
             current_price=?5, exit_price=?6, target_price=?7, sl_price=?8,
             trailing_stop_price=?9, trailing_activated=?10, highest_price_seen=?11,
             lowest_price_seen=?12, status=?13, is_closed=?14, exit_reason=?15,
             exited_at=?16 WHERE id=?1",
            params![
                p.id,
                if p.direction == Direction::Short { "SHORT" } else { "LONG" },
                p.quantity,
                p.entry_price,
                p.current_price,
                p.exit_price,
                p.target_price,
                p.sl_price,
                p.trailing_stop_price,
                p.trailing_activated,
                p.highest_price_seen,
                p.lowest_price_seen,
                Self::status_str(p.status),
                p.is_closed,
                p.exit_reason.map(Self::exit_reason_str),
                p.exited_at.as_ref().map(fmt_dt),
            ],
        )?;
        Ok(())
    }

    pub fn list_positions_by_instance(&self, instance_id: i64) -> Result<Vec<WatchlistPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM watchlist_positions WHERE instance_id=?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![instance_id], Self::row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_open_positions_by_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<WatchlistPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM watchlist_positions WHERE instance_id=?1 AND status='OPEN' ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![instance_id], Self::row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // --------------------------------------------------------------- market data

    /// Upsert a batch of rows as a single transaction.
    pub fn upsert_market_data_batch(&self, rows: &[MarketDataRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT INTO market_data
                    (exchange, symbol, token, ltp, open, high, low, close, volume,
                     bid_price, bid_qty, ask_price, ask_qty, last_updated, data_source)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(exchange, symbol) DO UPDATE SET
                    token=excluded.token, ltp=excluded.ltp, open=excluded.open,
                    high=excluded.high, low=excluded.low, close=excluded.close,
                    volume=excluded.volume, bid_price=excluded.bid_price,
                    bid_qty=excluded.bid_qty, ask_price=excluded.ask_price,
                    ask_qty=excluded.ask_qty, last_updated=excluded.last_updated,
                    data_source=excluded.data_source
                 WHERE excluded.last_updated >= market_data.last_updated",
                params![
                    row.exchange,
                    row.symbol,
                    row.token,
                    row.ltp,
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.volume,
                    row.bid_price,
                    row.bid_qty,
                    row.ask_price,
                    row.ask_qty,
                    fmt_dt(&row.last_updated),
                    row.data_source,
                ],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn row_to_market_data(row: &Row) -> rusqlite::Result<MarketDataRow> {
        let last_updated: String = row.get("last_updated")?;
        Ok(MarketDataRow {
            exchange: row.get("exchange")?,
            symbol: row.get("symbol")?,
            token: row.get("token")?,
            ltp: row.get("ltp")?,
            open: row.get("open")?,
            high: row.get("high")?,
            low: row.get("low")?,
            close: row.get("close")?,
            volume: row.get("volume")?,
            bid_price: row.get("bid_price")?,
            bid_qty: row.get("bid_qty")?,
            ask_price: row.get("ask_price")?,
            ask_qty: row.get("ask_qty")?,
            last_updated: parse_dt(&last_updated),
            data_source: row.get("data_source")?,
        })
    }

    pub fn get_latest_market_data(
        &self,
        exchange: &str,
        symbol: &str,
    ) -> Result<Option<MarketDataRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM market_data WHERE exchange=?1 AND symbol=?2")?;
        let mut rows = stmt.query(params![exchange, symbol])?;
        Ok(match rows.next()? {
            Some(row) => Some(Self::row_to_market_data(row)?),
            None => None,
        })
    }

    // ------------------------------------------------------------------- alerts

    fn row_to_alert(row: &Row) -> rusqlite::Result<SystemAlert> {
        let severity: String = row.get("severity")?;
        let details_json: Option<String> = row.get("details_json")?;
        let created_at: String = row.get("created_at")?;
        let resolved_at: Option<String> = row.get("resolved_at")?;
        Ok(SystemAlert {
            id: row.get("id")?,
            alert_type: row.get("alert_type")?,
            severity: match severity.as_str() {
                "WARNING" => AlertSeverity::Warning,
                "ERROR" => AlertSeverity::Error,
                "CRITICAL" => AlertSeverity::Critical,
                _ => AlertSeverity::Info,
            },
            title: row.get("title")?,
            message: row.get("message")?,
            details: details_json.and_then(|s| serde_json::from_str(&s).ok()),
            instance_id: row.get("instance_id")?,
            watchlist_id: row.get("watchlist_id")?,
            is_resolved: row.get("is_resolved")?,
            created_at: parse_dt(&created_at),
            resolved_at: resolved_at.map(|s| parse_dt(&s)),
            resolved_by: row.get("resolved_by")?,
        })
    }

    pub fn insert_alert(&self, a: &SystemAlert) -> Result<SystemAlert> {
        let conn = self.conn.lock();
        let details_json = a
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO system_alerts
                (alert_type, severity, title, message, details_json, instance_id,
                 watchlist_id, is_resolved, created_at, resolved_at, resolved_by)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                a.alert_type,
                a.severity.as_str(),
                a.title,
                a.message,
                details_json,
                a.instance_id,
                a.watchlist_id,
                a.is_resolved,
                fmt_dt(&a.created_at),
                a.resolved_at.as_ref().map(fmt_dt),
                a.resolved_by,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(SystemAlert { id, ..a.clone() })
    }

    pub fn list_unresolved_alerts(&self, limit: usize) -> Result<Vec<SystemAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM system_alerts WHERE is_resolved=0 ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_alert)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_alerts_by_type(&self, alert_type: &str, limit: usize) -> Result<Vec<SystemAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM system_alerts WHERE alert_type=?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![alert_type, limit as i64], Self::row_to_alert)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_alerts_by_severity(
        &self,
        severity: AlertSeverity,
        limit: usize,
    ) -> Result<Vec<SystemAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM system_alerts WHERE severity=?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![severity.as_str(), limit as i64], Self::row_to_alert)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_alerts_by_instance(&self, instance_id: i64, limit: usize) -> Result<Vec<SystemAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM system_alerts WHERE instance_id=?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![instance_id, limit as i64], Self::row_to_alert)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_alerts_by_watchlist(
        &self,
        watchlist_id: i64,
        limit: usize,
    ) -> Result<Vec<SystemAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM system_alerts WHERE watchlist_id=?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![watchlist_id, limit as i64], Self::row_to_alert)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn resolve_alert(&self, id: i64, resolved_by: &str) -> Result<WriteResult> {
        let conn = self.conn.lock();
        let rows_changed = conn.execute(
            "UPDATE system_alerts SET is_resolved=1, resolved_at=?2, resolved_by=?3
             WHERE id=?1 AND is_resolved=0",
            params![id, fmt_dt(&Utc::now()), resolved_by],
        )?;
        Ok(WriteResult {
            last_inserted_id: id,
            rows_changed,
        })
    }

    pub fn resolve_all_alerts_of_type(&self, alert_type: &str, resolved_by: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE system_alerts SET is_resolved=1, resolved_at=?2, resolved_by=?3
             WHERE alert_type=?1 AND is_resolved=0",
            params![alert_type, fmt_dt(&Utc::now()), resolved_by],
        )?)
    }

    pub fn auto_resolve_alerts_older_than_days(&self, days: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = Utc::now() - chrono::Duration::days(days);
        Ok(conn.execute(
            "UPDATE system_alerts SET is_resolved=1, resolved_at=?2, resolved_by='system:auto-resolve'
             WHERE is_resolved=0 AND created_at < ?1",
            params![fmt_dt(&cutoff), fmt_dt(&Utc::now())],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_instance(host_url: &str) -> Instance {
        Instance {
            id: 0,
            name: "test".to_string(),
            host_url: host_url.to_string(),
            api_key: "secret".to_string(),
            strategy_tag: None,
            target_profit: 5000.0,
            target_loss: 2000.0,
            is_active: true,
            is_analyzer_mode: false,
            order_placement_disabled: false,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
            current_balance: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_pnl: 0.0,
            market_data_role: MarketDataRole::None,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn create_and_get_instance_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let created = store.create_instance(&new_instance("http://host-a")).unwrap();
        let fetched = store.get_instance(created.id).unwrap().unwrap();
        assert_eq!(fetched.host_url, "http://host-a");
        assert_eq!(fetched.health_status, HealthStatus::Unknown);
    }

    #[test]
    fn duplicate_host_url_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.create_instance(&new_instance("http://dup")).unwrap();
        let second = store.create_instance(&new_instance("http://dup"));
        assert!(second.is_err());
    }

    #[test]
    fn binding_instances_to_watchlist() {
        let store = Store::open_in_memory().unwrap();
        let instance = store.create_instance(&new_instance("http://bound")).unwrap();
        let watchlist = store
            .create_watchlist(&Watchlist {
                id: 0,
                name: "w1".to_string(),
                description: None,
                is_active: true,
            })
            .unwrap();
        store.bind_instances(watchlist.id, &[instance.id]).unwrap();
        let bound = store.list_bound_instances(watchlist.id).unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].id, instance.id);
    }

    #[test]
    fn market_data_upsert_is_single_row_per_key() {
        let store = Store::open_in_memory().unwrap();
        let row = MarketDataRow {
            exchange: "NSE".to_string(),
            symbol: "SBIN".to_string(),
            token: None,
            ltp: 500.0,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            bid_price: None,
            bid_qty: None,
            ask_price: None,
            ask_qty: None,
            last_updated: Utc::now(),
            data_source: "test".to_string(),
        };
        store.upsert_market_data_batch(&[row.clone()]).unwrap();
        let mut later = row.clone();
        later.ltp = 510.0;
        later.last_updated = Utc::now() + chrono::Duration::seconds(1);
        store.upsert_market_data_batch(&[later]).unwrap();

        let fetched = store.get_latest_market_data("NSE", "SBIN").unwrap().unwrap();
        assert_eq!(fetched.ltp, 510.0);
    }

    #[test]
    fn alert_resolution_is_idempotent_per_row() {
        let store = Store::open_in_memory().unwrap();
        let alert = store
            .insert_alert(&SystemAlert {
                id: 0,
                alert_type: "INSTANCE_OFFLINE".to_string(),
                severity: AlertSeverity::Warning,
                title: "offline".to_string(),
                message: "instance went offline".to_string(),
                details: None,
                instance_id: None,
                watchlist_id: None,
                is_resolved: false,
                created_at: Utc::now(),
                resolved_at: None,
                resolved_by: None,
            })
            .unwrap();

        let first = store.resolve_alert(alert.id, "operator").unwrap();
        assert_eq!(first.rows_changed, 1);
        let second = store.resolve_alert(alert.id, "operator").unwrap();
        assert_eq!(second.rows_changed, 0);
    }
}
