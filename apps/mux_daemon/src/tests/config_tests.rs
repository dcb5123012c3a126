use std::collections::HashMap;

use super::*;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_match_multiplexer_defaults() {
    let settings = settings_from(None, env_from(&[]));
    assert_eq!(settings, Settings::default());

    let options = settings.mux_options();
    assert_eq!(options.min_reconnect_interval, Duration::from_secs(5));
    assert_eq!(options.max_queue_len, Some(1024));
    assert_eq!(options.subprotocol, MuxOptions::default().subprotocol);
}

#[test]
fn settings_file_overrides_defaults() {
    let file = r#"
        bind_addr = "0.0.0.0:9000"
        database_url = "sqlite://./var/chat.db"
        min_reconnect_interval_ms = 2500
        max_queue_len = "64"
    "#;

    let settings = settings_from(Some(file), env_from(&[]));

    assert_eq!(settings.bind_addr, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./var/chat.db");
    assert_eq!(settings.min_reconnect_interval_ms, 2500);
    assert_eq!(settings.max_queue_len, 64);
}

#[test]
fn environment_overrides_file_and_app_prefix_wins() {
    let file = r#"bind_addr = "0.0.0.0:9000""#;
    let env = env_from(&[
        ("MUX_BIND", "127.0.0.1:1111"),
        ("APP__BIND_ADDR", "127.0.0.1:2222"),
        ("DATABASE_URL", "sqlite::memory:"),
        ("APP__SUBPROTOCOL", "chat.v2"),
        ("APP__FILE_FETCH_TIMEOUT_SECS", "7"),
    ]);

    let settings = settings_from(Some(file), env);

    assert_eq!(settings.bind_addr, "127.0.0.1:2222");
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.subprotocol, "chat.v2");
    assert_eq!(settings.file_fetch_timeout(), Duration::from_secs(7));
}

#[test]
fn unparseable_numbers_keep_previous_value() {
    let env = env_from(&[
        ("APP__MIN_RECONNECT_INTERVAL_MS", "soon"),
        ("APP__MAX_QUEUE_LEN", "-3"),
    ]);

    let settings = settings_from(None, env);

    assert_eq!(
        settings.min_reconnect_interval_ms,
        Settings::default().min_reconnect_interval_ms
    );
    assert_eq!(settings.max_queue_len, Settings::default().max_queue_len);
}

#[test]
fn broken_settings_file_is_ignored() {
    let settings = settings_from(Some("bind_addr = "), env_from(&[]));
    assert_eq!(settings, Settings::default());
}

#[test]
fn zero_queue_length_means_unbounded() {
    let settings = settings_from(None, env_from(&[("APP__MAX_QUEUE_LEN", "0")]));
    assert_eq!(settings.mux_options().max_queue_len, None);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite:data/test.db"), "sqlite://data/test.db");
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[tokio::test]
async fn normalized_plain_path_opens_in_a_missing_directory() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("mux.db");

    let database_url = normalize_database_url(db_path.to_string_lossy().as_ref());
    let storage = storage::Storage::new(&database_url).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
