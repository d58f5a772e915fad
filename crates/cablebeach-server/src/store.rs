use std::collections::HashMap;

use cablebeach_config::Store;
use cablebeach_contracts::{AgentSession, UserProfile};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    users: HashMap<Uuid, UserProfile>,
}

pub struct SqliteStore {
    conn: Connection,
}

/// User account and agent session records.
pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn open(cfg: &Store) -> Result<Self, String> {
        if cfg.kind == "sqlite" {
            let sqlite_path = cfg
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::default()))
        }
    }

    pub fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.users.get(&id).cloned()),
            StoreBackend::Sqlite(store) => store.get_profile(id),
        }
    }

    pub fn get_profile_by_name(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Option<UserProfile>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .users
                .values()
                .find(|p| same_name(p, first_name, last_name))
                .cloned()),
            StoreBackend::Sqlite(store) => store.get_profile_by_name(first_name, last_name),
        }
    }

    /// Adds a new account. Returns `false` when the id or the name is already taken.
    pub fn add_user(&mut self, profile: &UserProfile) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => {
                if store.users.contains_key(&profile.id)
                    || store
                        .users
                        .values()
                        .any(|p| same_name(p, &profile.first_name, &profile.last_name))
                {
                    return Ok(false);
                }
                store.users.insert(profile.id, profile.clone());
                Ok(true)
            }
            StoreBackend::Sqlite(store) => store.add_user(profile),
        }
    }

    pub fn save_agent(&mut self, user_id: Uuid, session: &AgentSession) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                let profile = store
                    .users
                    .get_mut(&user_id)
                    .ok_or_else(|| format!("unknown user {user_id}"))?;
                profile.current_agent = Some(session.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_agent(user_id, session),
        }
    }

    /// Marks the user's current session offline. No-op without a session.
    pub fn log_off(&mut self, user_id: Uuid, reason: &str) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(agent) = store
                    .users
                    .get_mut(&user_id)
                    .and_then(|p| p.current_agent.as_mut())
                {
                    agent.online = false;
                    agent.logout_reason = Some(reason.to_string());
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.log_off(user_id, reason),
        }
    }
}

fn same_name(profile: &UserProfile, first_name: &str, last_name: &str) -> bool {
    profile.first_name.eq_ignore_ascii_case(first_name)
        && profile.last_name.eq_ignore_ascii_case(last_name)
}

const PROFILE_COLUMNS: &str = "
    u.id, u.first_name, u.last_name, u.email, u.password_hash, u.home_region_x,
    u.home_region_y, u.created_at, a.session_id, a.secure_session_id, a.online,
    a.login_at, a.logout_reason
";

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL COLLATE NOCASE,
                last_name TEXT NOT NULL COLLATE NOCASE,
                email TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                home_region_x INTEGER NOT NULL,
                home_region_y INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (first_name, last_name)
            );
            CREATE TABLE IF NOT EXISTS agents (
                user_id TEXT PRIMARY KEY REFERENCES users(id),
                session_id TEXT NOT NULL,
                secure_session_id TEXT NOT NULL,
                online INTEGER NOT NULL,
                login_at TEXT NOT NULL,
                logout_reason TEXT
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn query_profile(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<UserProfile>, String> {
        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM users u LEFT JOIN agents a ON a.user_id = u.id WHERE {filter}"
        );
        self.conn
            .query_row(&sql, args, |row| {
                let id: String = row.get(0)?;
                let session_id: Option<String> = row.get(8)?;
                let secure_session_id: Option<String> = row.get(9)?;
                let online: Option<i64> = row.get(10)?;
                let login_at: Option<String> = row.get(11)?;
                let current_agent = match (session_id, secure_session_id, online, login_at) {
                    (Some(session_id), Some(secure_session_id), Some(online), Some(login_at)) => {
                        Some(AgentSession {
                            session_id: parse_uuid(&session_id, 8)?,
                            secure_session_id: parse_uuid(&secure_session_id, 9)?,
                            online: online != 0,
                            login_at,
                            logout_reason: row.get(12)?,
                        })
                    }
                    _ => None,
                };
                Ok(UserProfile {
                    id: parse_uuid(&id, 0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    email: row.get(3)?,
                    password_hash: row.get(4)?,
                    home_region_x: row.get(5)?,
                    home_region_y: row.get(6)?,
                    created_at: row.get(7)?,
                    current_agent,
                })
            })
            .optional()
            .map_err(|e| e.to_string())
    }

    fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>, String> {
        self.query_profile("u.id = ?1", &[&id.to_string()])
    }

    fn get_profile_by_name(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Option<UserProfile>, String> {
        self.query_profile(
            "u.first_name = ?1 AND u.last_name = ?2",
            &[&first_name, &last_name],
        )
    }

    fn add_user(&mut self, profile: &UserProfile) -> Result<bool, String> {
        let inserted = self
            .conn
            .execute(
                "
                INSERT OR IGNORE INTO users
                (id, first_name, last_name, email, password_hash, home_region_x, home_region_y, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    profile.id.to_string(),
                    profile.first_name,
                    profile.last_name,
                    profile.email,
                    profile.password_hash,
                    profile.home_region_x,
                    profile.home_region_y,
                    profile.created_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(inserted == 1)
    }

    fn save_agent(&mut self, user_id: Uuid, session: &AgentSession) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO agents (user_id, session_id, secure_session_id, online, login_at, logout_reason)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(user_id) DO UPDATE SET
                    session_id=excluded.session_id,
                    secure_session_id=excluded.secure_session_id,
                    online=excluded.online,
                    login_at=excluded.login_at,
                    logout_reason=excluded.logout_reason
                ",
                params![
                    user_id.to_string(),
                    session.session_id.to_string(),
                    session.secure_session_id.to_string(),
                    if session.online { 1 } else { 0 },
                    session.login_at,
                    session.logout_reason
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn log_off(&mut self, user_id: Uuid, reason: &str) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE agents SET online = 0, logout_reason = ?2 WHERE user_id = ?1",
                params![user_id.to_string(), reason],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn parse_uuid(value: &str, column: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}
