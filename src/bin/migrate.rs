//! Schema migration CLI.
//!
//! The primary schema is one idempotent script (`db::SCHEMA_SQL`, all
//! `CREATE TABLE IF NOT EXISTS`), so "up" applying it is safe to run any
//! number of times. `schema_migrations` just records that version 1 has
//! been applied; there is no down migration for a single monolithic schema.

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::process::ExitCode;
use tracing::{error, info};

use control_plane::db::SCHEMA_SQL;

const SCHEMA_VERSION: i64 = 1;

#[derive(Parser)]
#[command(name = "control-plane-migrate", about = "Manage the control-plane database schema")]
struct Cli {
    #[arg(long, env = "DB_PATH", default_value = "./control_plane.db")]
    db_path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the schema, recording the current version.
    Up,
    /// Print whether the schema is current.
    Status,
    /// Not supported for this schema; reports the reason and exits non-zero.
    Down,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let conn = match Connection::open(&cli.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(db_path = %cli.db_path, error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Up => run_up(&conn, &cli.db_path),
        Command::Status => run_status(&conn),
        Command::Down => {
            error!("no down migration: the schema is a single idempotent script");
            ExitCode::FAILURE
        }
    }
}

fn run_up(conn: &Connection, db_path: &str) -> ExitCode {
    if let Err(e) = conn.execute_batch(SCHEMA_SQL) {
        error!(db_path, error = %e, "failed to apply schema");
        return ExitCode::FAILURE;
    }

    let applied: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            [SCHEMA_VERSION],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if applied == 0 {
        if let Err(e) = conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [SCHEMA_VERSION],
        ) {
            error!(db_path, error = %e, "failed to record migration version");
            return ExitCode::FAILURE;
        }
        info!(db_path, version = SCHEMA_VERSION, "schema applied");
    } else {
        info!(db_path, version = SCHEMA_VERSION, "schema already current");
    }

    ExitCode::SUCCESS
}

fn run_status(conn: &Connection) -> ExitCode {
    let version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(None);

    match version {
        Some(v) if v >= SCHEMA_VERSION => {
            info!(version = v, "schema is up to date");
            ExitCode::SUCCESS
        }
        Some(v) => {
            info!(current = v, target = SCHEMA_VERSION, "schema is behind; run `up`");
            ExitCode::FAILURE
        }
        None => {
            info!("schema has not been initialized; run `up`");
            ExitCode::FAILURE
        }
    }
}
