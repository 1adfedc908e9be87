//! Schema and pragmas for the primary control-plane database.
//!
//! WAL journaling, a busy-timeout long enough to survive concurrent writers,
//! and foreign keys enabled. Pragma tuning (`cache_size`, `temp_store`,
//! `mmap_size`) is sized for a control-plane-sized dataset: a handful of
//! instances and their watchlists, not a high-frequency tick log.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA cache_size = -10000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 67108864;
PRAGMA auto_vacuum = INCREMENTAL;

CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    host_url TEXT NOT NULL UNIQUE,
    api_key TEXT NOT NULL,
    strategy_tag TEXT,
    target_profit REAL NOT NULL DEFAULT 5000,
    target_loss REAL NOT NULL DEFAULT 2000,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_analyzer_mode INTEGER NOT NULL DEFAULT 0,
    order_placement_disabled INTEGER NOT NULL DEFAULT 0,
    health_status TEXT NOT NULL DEFAULT 'unknown',
    last_health_check TEXT,
    current_balance REAL NOT NULL DEFAULT 0,
    realized_pnl REAL NOT NULL DEFAULT 0,
    unrealized_pnl REAL NOT NULL DEFAULT 0,
    total_pnl REAL NOT NULL DEFAULT 0,
    market_data_role TEXT NOT NULL DEFAULT 'none',
    last_updated TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS watchlists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS watchlist_symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    watchlist_id INTEGER NOT NULL REFERENCES watchlists(id) ON DELETE CASCADE,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    token TEXT,
    lot_size INTEGER NOT NULL DEFAULT 1,
    qty_mode TEXT NOT NULL DEFAULT 'fixed',
    qty_value REAL NOT NULL DEFAULT 1,
    qty_units TEXT,
    min_qty_per_click INTEGER,
    max_qty_per_click INTEGER,
    capital_ceiling_per_trade REAL,
    contract_multiplier REAL NOT NULL DEFAULT 1.0,
    rounding TEXT NOT NULL DEFAULT 'floor_to_lot',
    product_type TEXT NOT NULL DEFAULT 'MIS',
    order_type TEXT NOT NULL DEFAULT 'MARKET',
    can_trade_equity INTEGER NOT NULL DEFAULT 1,
    can_trade_futures INTEGER NOT NULL DEFAULT 0,
    can_trade_options INTEGER NOT NULL DEFAULT 0,
    options_strike_offset TEXT,
    options_expiry_mode TEXT,
    target_type TEXT NOT NULL DEFAULT 'NONE',
    target_value REAL,
    sl_type TEXT NOT NULL DEFAULT 'NONE',
    sl_value REAL,
    ts_type TEXT NOT NULL DEFAULT 'NONE',
    ts_value REAL,
    trailing_activation_type TEXT NOT NULL DEFAULT 'IMMEDIATE',
    trailing_activation_value REAL,
    max_position_size INTEGER,
    max_instances INTEGER,
    is_enabled INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_watchlist_symbols_watchlist
    ON watchlist_symbols(watchlist_id);

CREATE TABLE IF NOT EXISTS watchlist_instances (
    watchlist_id INTEGER NOT NULL REFERENCES watchlists(id) ON DELETE CASCADE,
    instance_id INTEGER NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    PRIMARY KEY (watchlist_id, instance_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS watchlist_orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    watchlist_id INTEGER NOT NULL REFERENCES watchlists(id) ON DELETE CASCADE,
    instance_id INTEGER NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    symbol_id INTEGER NOT NULL REFERENCES watchlist_symbols(id) ON DELETE CASCADE,
    action TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    order_type TEXT NOT NULL,
    product_type TEXT NOT NULL,
    price REAL,
    trigger_price REAL,
    status TEXT NOT NULL DEFAULT 'pending',
    order_id TEXT,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    average_price REAL NOT NULL DEFAULT 0,
    position_id INTEGER REFERENCES watchlist_positions(id) ON DELETE SET NULL,
    message TEXT,
    placed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_watchlist_orders_instance_status
    ON watchlist_orders(instance_id, status);
CREATE INDEX IF NOT EXISTS idx_watchlist_orders_status
    ON watchlist_orders(status);
CREATE INDEX IF NOT EXISTS idx_watchlist_orders_order_id
    ON watchlist_orders(instance_id, order_id);

CREATE TABLE IF NOT EXISTS watchlist_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    watchlist_id INTEGER NOT NULL REFERENCES watchlists(id) ON DELETE CASCADE,
    instance_id INTEGER NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    symbol_id INTEGER NOT NULL REFERENCES watchlist_symbols(id) ON DELETE CASCADE,
    direction TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    entry_price REAL NOT NULL DEFAULT 0,
    current_price REAL NOT NULL DEFAULT 0,
    exit_price REAL,
    target_price REAL,
    sl_price REAL,
    trailing_stop_price REAL,
    trailing_activated INTEGER NOT NULL DEFAULT 0,
    highest_price_seen REAL NOT NULL DEFAULT 0,
    lowest_price_seen REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'PENDING',
    is_closed INTEGER NOT NULL DEFAULT 0,
    exit_reason TEXT,
    entered_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    exited_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_watchlist_positions_instance
    ON watchlist_positions(instance_id, is_closed);
CREATE INDEX IF NOT EXISTS idx_watchlist_positions_watchlist
    ON watchlist_positions(watchlist_id, is_closed);

CREATE TABLE IF NOT EXISTS market_data (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    token TEXT,
    ltp REAL NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    volume INTEGER,
    bid_price REAL,
    bid_qty INTEGER,
    ask_price REAL,
    ask_qty INTEGER,
    last_updated TEXT NOT NULL,
    data_source TEXT NOT NULL,
    PRIMARY KEY (exchange, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS system_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    details_json TEXT,
    instance_id INTEGER REFERENCES instances(id) ON DELETE SET NULL,
    watchlist_id INTEGER REFERENCES watchlists(id) ON DELETE SET NULL,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    resolved_at TEXT,
    resolved_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_system_alerts_unresolved
    ON system_alerts(is_resolved, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_system_alerts_type
    ON system_alerts(alert_type, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_system_alerts_severity
    ON system_alerts(severity, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_system_alerts_instance
    ON system_alerts(instance_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_system_alerts_watchlist
    ON system_alerts(watchlist_id, created_at DESC);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;
