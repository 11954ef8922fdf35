use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};

use crate::config::ScriptingConfig;
use crate::scripting::script::ScriptState;
use crate::scripting::version::VersionStamps;

/// Initialise (or migrate) the local SQLite database at `db_path`.
/// Creates all tables if they don't exist.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let url = format!("sqlite:{db_path}?mode=rwc");
    let pool = SqlitePool::connect(&url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Private in-memory database, used by tests and one-shot CLI runs.
pub async fn init_memory_db() -> Result<SqlitePool, sqlx::Error> {
    // every connection would get its own memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scripts (
            id                TEXT    PRIMARY KEY,
            title             TEXT    NOT NULL DEFAULT '',
            params            TEXT    NOT NULL DEFAULT '',
            body              TEXT    NOT NULL DEFAULT '',
            bindings_json     TEXT    NOT NULL,
            proxy_roles_json  TEXT    NOT NULL DEFAULT '[]',
            code              BLOB,
            signature_json    TEXT,
            code_digest       TEXT,
            runtime_tag       TEXT,
            script_magic      INTEGER,
            errors_json       TEXT    NOT NULL DEFAULT '[]',
            warnings_json     TEXT    NOT NULL DEFAULT '[]',
            modified_at       TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scripting_config (
            id          INTEGER PRIMARY KEY DEFAULT 1,
            config_json TEXT    NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

// ── Scripts ───────────────────────────────────────────────────────────────────

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(text).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn map_script_row(r: SqliteRow) -> Result<ScriptState, sqlx::Error> {
    let stamps = match (
        r.get::<Option<String>, _>("runtime_tag"),
        r.get::<Option<i64>, _>("script_magic"),
    ) {
        (Some(runtime_tag), Some(magic)) => Some(VersionStamps {
            runtime_tag,
            script_magic: u32::try_from(magic).unwrap_or(0),
        }),
        _ => None,
    };
    let signature = match r.get::<Option<String>, _>("signature_json") {
        Some(text) => Some(from_json(&text)?),
        None => None,
    };
    Ok(ScriptState {
        id: r.get("id"),
        title: r.get("title"),
        params: r.get("params"),
        body: r.get("body"),
        bindings: from_json(&r.get::<String, _>("bindings_json"))?,
        proxy_roles: from_json(&r.get::<String, _>("proxy_roles_json"))?,
        code: r.get("code"),
        signature,
        code_digest: r.get("code_digest"),
        stamps,
        errors: from_json(&r.get::<String, _>("errors_json"))?,
        warnings: from_json(&r.get::<String, _>("warnings_json"))?,
        modified_at: r.get::<DateTime<Utc>, _>("modified_at"),
    })
}

pub async fn save_script(pool: &SqlitePool, state: &ScriptState) -> Result<(), sqlx::Error> {
    let signature_json = match &state.signature {
        Some(sig) => Some(to_json(sig)?),
        None => None,
    };
    sqlx::query(
        r#"
        INSERT INTO scripts (
            id, title, params, body, bindings_json, proxy_roles_json, code,
            signature_json, code_digest, runtime_tag, script_magic,
            errors_json, warnings_json, modified_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title            = excluded.title,
            params           = excluded.params,
            body             = excluded.body,
            bindings_json    = excluded.bindings_json,
            proxy_roles_json = excluded.proxy_roles_json,
            code             = excluded.code,
            signature_json   = excluded.signature_json,
            code_digest      = excluded.code_digest,
            runtime_tag      = excluded.runtime_tag,
            script_magic     = excluded.script_magic,
            errors_json      = excluded.errors_json,
            warnings_json    = excluded.warnings_json,
            modified_at      = excluded.modified_at
        "#,
    )
    .bind(&state.id)
    .bind(&state.title)
    .bind(&state.params)
    .bind(&state.body)
    .bind(to_json(&state.bindings)?)
    .bind(to_json(&state.proxy_roles)?)
    .bind(state.code.as_deref())
    .bind(signature_json)
    .bind(state.code_digest.as_deref())
    .bind(state.stamps.as_ref().map(|s| s.runtime_tag.clone()))
    .bind(state.stamps.as_ref().map(|s| i64::from(s.script_magic)))
    .bind(to_json(&state.errors)?)
    .bind(to_json(&state.warnings)?)
    .bind(state.modified_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_script(pool: &SqlitePool, id: &str) -> Result<Option<ScriptState>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM scripts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(map_script_row).transpose()
}

pub async fn load_scripts(pool: &SqlitePool) -> Result<Vec<ScriptState>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM scripts ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(map_script_row).collect()
}

/// Returns whether a row was removed.
pub async fn delete_script(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let res = sqlx::query("DELETE FROM scripts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ── Scripting config ──────────────────────────────────────────────────────────

/// Stored config, or the defaults when none was saved yet.
pub async fn load_scripting_config(pool: &SqlitePool) -> Result<ScriptingConfig, sqlx::Error> {
    let row = sqlx::query("SELECT config_json FROM scripting_config WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    match row.map(|r| r.get::<String, _>("config_json")) {
        Some(json) => ScriptingConfig::from_json(&json).map_err(|e| sqlx::Error::Decode(Box::new(e))),
        None => Ok(ScriptingConfig::default()),
    }
}

pub async fn save_scripting_config(
    pool: &SqlitePool,
    config: &ScriptingConfig,
) -> Result<(), sqlx::Error> {
    let json = config.to_json().map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO scripting_config (id, config_json) VALUES (1, ?)
        ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json
        "#,
    )
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::script::Script;
    use crate::scripting::version::VersionGuard;
    use crate::security::{Principal, SecurityManager};

    #[tokio::test]
    async fn script_state_survives_a_round_trip() {
        let pool = init_memory_db().await.unwrap();
        let security = SecurityManager::with_roles(Principal::anonymous());
        let script = Script::new("greet").unwrap();
        script
            .write("##title=Greeter\n##parameters=name\nreturn 'hi ' .. name\n", &security)
            .unwrap();
        let state = script.to_state();
        save_script(&pool, &state).await.unwrap();

        let loaded = load_script(&pool, "greet").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Greeter");
        assert_eq!(loaded.params, "name");
        assert_eq!(loaded.code, state.code);
        assert_eq!(loaded.code_digest, state.code_digest);
        assert_eq!(loaded.stamps, state.stamps);
        assert_eq!(loaded.signature, state.signature);
        assert_eq!(loaded.bindings, state.bindings);
        assert_eq!(loaded.modified_at.timestamp_millis(), state.modified_at.timestamp_millis());

        let restored = Script::from_state(loaded, &VersionGuard::new()).unwrap();
        assert!(!restored.is_dirty());
        assert_eq!(restored.compile_count(), 0);
        assert_eq!(restored.read(), script.read());
    }

    #[tokio::test]
    async fn failed_compiles_persist_without_code() {
        let pool = init_memory_db().await.unwrap();
        let security = SecurityManager::with_roles(Principal::anonymous());
        let script = Script::new("broken").unwrap();
        script.write("return (", &security).unwrap();
        save_script(&pool, &script.to_state()).await.unwrap();

        let loaded = load_script(&pool, "broken").await.unwrap().unwrap();
        assert!(loaded.code.is_none());
        assert!(!loaded.errors.is_empty());
    }

    #[tokio::test]
    async fn upsert_list_and_delete() {
        let pool = init_memory_db().await.unwrap();
        for id in ["b", "a"] {
            save_script(&pool, &Script::new(id).unwrap().to_state()).await.unwrap();
        }
        save_script(&pool, &Script::new("a").unwrap().to_state()).await.unwrap();
        let ids: Vec<String> = load_scripts(&pool).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(delete_script(&pool, "a").await.unwrap());
        assert!(!delete_script(&pool, "a").await.unwrap());
        assert!(load_script(&pool, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scripting_config_defaults_then_persists() {
        let pool = init_memory_db().await.unwrap();
        assert_eq!(load_scripting_config(&pool).await.unwrap(), ScriptingConfig::default());

        let config = ScriptingConfig {
            cache_key_includes_namespace: true,
            max_cache_entries: 10,
            ..ScriptingConfig::default()
        };
        save_scripting_config(&pool, &config).await.unwrap();
        assert_eq!(load_scripting_config(&pool).await.unwrap(), config);
    }
}
