pub const SCHEMA: &str = r#"
-- Registered users
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL  -- Argon2 PHC string
);

-- One row per stored prediction
CREATE TABLE IF NOT EXISTS history_record (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES account(id) ON DELETE CASCADE,
    probabilities TEXT NOT NULL,  -- JSON array, parallel to the label vocabulary
    highest_prob REAL NOT NULL,
    pred TEXT NOT NULL,
    image BLOB NOT NULL,          -- raw RGB8 pixels, model x model
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_account ON history_record(account_id);
CREATE INDEX IF NOT EXISTS idx_history_pred ON history_record(pred);
"#;
