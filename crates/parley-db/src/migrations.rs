use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            is_online   INTEGER NOT NULL DEFAULT 0,
            last_seen   TEXT
        );

        -- Direct rooms are canonical: user_a is always the lower id, so a
        -- room between two users maps to exactly one row regardless of who
        -- initiated it.
        CREATE TABLE IF NOT EXISTS rooms (
            id          INTEGER PRIMARY KEY,
            user_a      INTEGER NOT NULL REFERENCES users(id),
            user_b      INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_a, user_b),
            CHECK(user_a < user_b)
        );

        CREATE TABLE IF NOT EXISTS groups (
            id          INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT,
            created_by  INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS channels (
            id          INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT,
            owner_id    INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS memberships (
            id              INTEGER PRIMARY KEY,
            kind            TEXT NOT NULL CHECK(kind IN ('group', 'channel')),
            conversation_id INTEGER NOT NULL,
            user_id         INTEGER NOT NULL REFERENCES users(id),
            role            TEXT NOT NULL,
            joined_at       TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(kind, conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_conversation
            ON memberships(kind, conversation_id);

        CREATE TABLE IF NOT EXISTS files (
            id              INTEGER PRIMARY KEY,
            uploader_id     INTEGER NOT NULL REFERENCES users(id),
            kind            TEXT,
            conversation_id INTEGER,
            name            TEXT NOT NULL,
            size            INTEGER NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY,
            kind            TEXT NOT NULL CHECK(kind IN ('room', 'group', 'channel')),
            conversation_id INTEGER NOT NULL,
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            content         TEXT,
            file_id         INTEGER REFERENCES files(id),
            reply_to        INTEGER REFERENCES messages(id),
            message_type    TEXT NOT NULL DEFAULT 'text',
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            edited          INTEGER NOT NULL DEFAULT 0,
            -- single-reader flag; meaningful for kind = 'room' only
            is_read         INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(kind, conversation_id, created_at);

        -- multi-reader read set for group/channel messages
        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     INTEGER NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_message_reads_message
            ON message_reads(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
