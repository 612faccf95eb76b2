//! Schema migrations
//!
//! Applied in order on open; each version is recorded in `schema_version`
//! and runs at most once.

use rusqlite::Connection;

struct Migration {
    version: u32,
    up_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: r"
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                balance_cache INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                deactivated_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS ledger_entries (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL REFERENCES accounts(account_id),
                amount INTEGER NOT NULL CHECK (amount != 0),
                kind TEXT NOT NULL,
                description TEXT NOT NULL,
                external_reference TEXT UNIQUE,
                related_entry TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_account ON ledger_entries(account_id, sequence);
            CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
                BEFORE UPDATE ON ledger_entries
                BEGIN SELECT RAISE(ABORT, 'ledger entries are immutable'); END;
            CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
                BEFORE DELETE ON ledger_entries
                BEGIN SELECT RAISE(ABORT, 'ledger entries are immutable'); END;
            CREATE TABLE IF NOT EXISTS webhook_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                processed_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                entry_id TEXT
            );
            CREATE TABLE IF NOT EXISTS trial_usage (
                client_fingerprint TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                queries_used INTEGER NOT NULL DEFAULT 0,
                first_used_at INTEGER NOT NULL,
                window_expires_at INTEGER NOT NULL,
                blocked INTEGER NOT NULL DEFAULT 0,
                block_reason TEXT,
                PRIMARY KEY (client_fingerprint, resource_id)
            );
        ",
}];

pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!("Running ledger migration v{}", migration.version);
            conn.execute_batch(migration.up_sql)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}
