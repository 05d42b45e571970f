//! Index database schema.
//!
//! Everything lives in one SQLite file (`index.db`). Timestamps are unix
//! microseconds. `fts_messages` is kept in sync by triggers so full-text search
//! is updated inside the same transaction as the message write.

pub const INDEX_DB_NAME: &str = "index.db";

pub const SCHEMA_VERSION: i64 = 1;

pub const INDEX_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slug TEXT NOT NULL UNIQUE,
        human_key TEXT NOT NULL UNIQUE,
        created_ts INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        name TEXT NOT NULL COLLATE NOCASE,
        program TEXT NOT NULL,
        model TEXT NOT NULL,
        task_description TEXT NOT NULL DEFAULT '',
        contact_policy TEXT NOT NULL DEFAULT 'auto',
        active INTEGER NOT NULL DEFAULT 1,
        inception_ts INTEGER NOT NULL,
        last_active_ts INTEGER NOT NULL,
        UNIQUE(project_id, name)
    );
    CREATE INDEX IF NOT EXISTS idx_agents_project_name ON agents(project_id, name);

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        sender_id INTEGER NOT NULL REFERENCES agents(id),
        thread_id TEXT,
        subject TEXT NOT NULL,
        body_md TEXT NOT NULL,
        importance TEXT NOT NULL DEFAULT 'normal',
        ack_required INTEGER NOT NULL DEFAULT 0,
        created_ts INTEGER NOT NULL,
        dedupe_key TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_project_created ON messages(project_id, created_ts);
    CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(project_id, thread_id);
    CREATE INDEX IF NOT EXISTS idx_messages_dedupe ON messages(project_id, sender_id, dedupe_key);

    CREATE TABLE IF NOT EXISTS message_recipients (
        message_id INTEGER NOT NULL REFERENCES messages(id),
        agent_id INTEGER NOT NULL REFERENCES agents(id),
        kind TEXT NOT NULL DEFAULT 'to',
        read_ts INTEGER,
        ack_ts INTEGER,
        PRIMARY KEY(message_id, agent_id)
    );
    CREATE INDEX IF NOT EXISTS idx_message_recipients_agent ON message_recipients(agent_id, message_id);

    CREATE TABLE IF NOT EXISTS file_reservations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        agent_id INTEGER NOT NULL REFERENCES agents(id),
        exclusive INTEGER NOT NULL DEFAULT 1,
        reason TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL DEFAULT 'active',
        created_ts INTEGER NOT NULL,
        expires_ts INTEGER NOT NULL,
        released_ts INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_file_reservations_project_state ON file_reservations(project_id, state, expires_ts);
    CREATE INDEX IF NOT EXISTS idx_file_reservations_agent ON file_reservations(project_id, agent_id, state);

    CREATE TABLE IF NOT EXISTS file_reservation_paths (
        reservation_id INTEGER NOT NULL REFERENCES file_reservations(id),
        position INTEGER NOT NULL,
        pattern TEXT NOT NULL,
        PRIMARY KEY(reservation_id, position)
    );

    CREATE TABLE IF NOT EXISTS agent_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        a_agent_id INTEGER NOT NULL REFERENCES agents(id),
        b_agent_id INTEGER NOT NULL REFERENCES agents(id),
        status TEXT NOT NULL DEFAULT 'pending',
        reason TEXT NOT NULL DEFAULT '',
        created_ts INTEGER NOT NULL,
        updated_ts INTEGER NOT NULL,
        expires_ts INTEGER,
        UNIQUE(project_id, a_agent_id, b_agent_id)
    );
    CREATE INDEX IF NOT EXISTS idx_agent_links_b ON agent_links(project_id, b_agent_id, status);

    CREATE VIRTUAL TABLE IF NOT EXISTS fts_messages USING fts5(
        message_id UNINDEXED,
        subject,
        body
    );

    CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
        INSERT INTO fts_messages(message_id, subject, body)
        VALUES (NEW.id, NEW.subject, NEW.body_md);
    END;

    CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
        DELETE FROM fts_messages WHERE message_id = OLD.id;
    END;

    CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
        DELETE FROM fts_messages WHERE message_id = OLD.id;
        INSERT INTO fts_messages(message_id, subject, body)
        VALUES (NEW.id, NEW.subject, NEW.body_md);
    END;
";
