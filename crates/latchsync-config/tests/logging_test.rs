//! Global subscriber installation. Kept in its own test binary because a
//! process can install only one.
#![allow(clippy::unwrap_used)]

use latchsync_config::{ConfigError, LoggingSettings, init_tracing};

#[test]
fn file_logging_installs_once() {
    let dir = tempfile::tempdir().unwrap();
    let settings = LoggingSettings {
        level: "debug".into(),
        json: true,
        file: Some(dir.path().join("logs").join("latchsync.log")),
    };

    let guard = init_tracing(&settings).unwrap();
    assert!(guard.is_some());
    tracing::info!(target: "latchsync_config", "hello");
    drop(guard);
    assert!(dir.path().join("logs").join("latchsync.log").exists());

    assert!(matches!(
        init_tracing(&LoggingSettings::default()),
        Err(ConfigError::Logging { .. })
    ));
}
