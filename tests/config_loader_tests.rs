use pos_connectors::config::{ConfigError, ConfigLoader};
use pos_connectors::models::ProviderType;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const VALID_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("POS_"))
        .collect();
    unsafe {
        for key in keys {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("POS_CRYPTO_KEY", VALID_KEY);
    }

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.webhook_max_failures, 10);
    assert_eq!(cfg.health_check_interval_seconds, 300);
    assert_eq!(cfg.pattern_threshold, 10);
    assert_eq!(cfg.retry.max_attempts, 3);
    assert_eq!(cfg.retry.backoff, "exponential");
    assert_eq!(cfg.crypto_key.as_ref().map(Vec::len), Some(32));
    assert!(cfg.rate_limit_overrides.is_empty());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "POS_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(&temp_dir, ".env.test", "POS_API_BIND_ADDR=192.168.0.10:5000\n");
    write_env_file(&temp_dir, ".env.test.local", "POS_API_BIND_ADDR=10.0.0.5:6000\n");

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "POS_PROFILE=test\nPOS_API_BIND_ADDR=127.0.0.1:4000\nPOS_CRYPTO_KEY={}\n",
            VALID_KEY
        ),
    );

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "POS_API_BIND_ADDR=127.0.0.1:3000\nPOS_WEBHOOK_MAX_FAILURES=4\n",
    );

    unsafe {
        env::set_var("POS_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("POS_CRYPTO_KEY", VALID_KEY);
    }

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.webhook_max_failures, 4);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("POS_API_BIND_ADDR", "not-an-addr");
        env::set_var("POS_CRYPTO_KEY", VALID_KEY);
    }
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn missing_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("crypto key is required");
    assert!(matches!(err, ConfigError::MissingCryptoKey));

    unsafe {
        env::set_var("POS_CRYPTO_KEY", "c2hvcnQ=");
    }
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("short crypto key should fail");
    assert!(matches!(
        err,
        ConfigError::InvalidCryptoKeyLength { length: 5 }
    ));

    clear_env();
}

#[test]
fn rate_limit_overrides_are_collected_per_provider() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "POS_CRYPTO_KEY={}\nPOS_RATE_LIMIT_SQUARE_PER_SECOND=5\nPOS_RATE_LIMIT_SQUARE_BURST=2\nPOS_RATE_LIMIT_CLOVER_PER_MINUTE=120\nPOS_RATE_LIMIT_CLOVER_PER_DAY=1\n",
            VALID_KEY
        ),
    );

    let cfg = loader_for(&temp_dir).load().expect("overrides load");

    let square = cfg
        .rate_limit_override(ProviderType::Square)
        .expect("square override present");
    assert_eq!(square.per_second, Some(5));
    assert_eq!(square.burst, Some(2));
    assert_eq!(square.per_minute, None);

    let clover = cfg
        .rate_limit_override(ProviderType::Clover)
        .expect("clover override present");
    assert_eq!(clover.per_minute, Some(120));
    assert!(cfg.rate_limit_override(ProviderType::Shopify).is_none());

    clear_env();
}

#[test]
fn unknown_rate_limit_provider_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("POS_CRYPTO_KEY", VALID_KEY);
        env::set_var("POS_RATE_LIMIT_TOAST_PER_SECOND", "3");
    }

    let err = loader_for(&temp_dir)
        .load()
        .expect_err("unknown provider should fail");
    assert!(matches!(err, ConfigError::UnknownRateLimitProvider { .. }));

    clear_env();
}

#[test]
fn retry_policy_settings_are_parsed_and_validated() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("POS_CRYPTO_KEY", VALID_KEY);
        env::set_var("POS_RETRY_MAX_ATTEMPTS", "5");
        env::set_var("POS_RETRY_BACKOFF", "Linear");
        env::set_var("POS_RETRY_RETRYABLE_CODES", "rate_limited, connection_error");
    }

    let cfg = loader_for(&temp_dir).load().expect("retry settings load");
    assert_eq!(cfg.retry.max_attempts, 5);
    assert_eq!(cfg.retry.backoff, "linear");
    assert_eq!(
        cfg.retry.retryable_codes,
        vec!["RATE_LIMITED".to_string(), "CONNECTION_ERROR".to_string()]
    );

    unsafe {
        env::set_var("POS_RETRY_BACKOFF", "fibonacci");
    }
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("unknown backoff should fail");
    assert!(matches!(err, ConfigError::InvalidRetryBackoff { .. }));

    clear_env();
}

#[test]
fn webhook_base_url_builds_notification_urls() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("POS_CRYPTO_KEY", VALID_KEY);
        env::set_var("POS_WEBHOOK_BASE_URL", "https://hooks.example.com/");
    }

    let cfg = loader_for(&temp_dir).load().expect("base url loads");
    let tenant_id = uuid::Uuid::nil();
    assert_eq!(
        cfg.webhook_notification_url(ProviderType::Shopify, tenant_id)
            .as_deref(),
        Some(
            "https://hooks.example.com/webhooks/shopify?tenant_id=00000000-0000-0000-0000-000000000000"
        )
    );

    unsafe {
        env::set_var("POS_WEBHOOK_BASE_URL", "not a url");
    }
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("invalid base url should fail");
    assert!(matches!(err, ConfigError::InvalidWebhookBaseUrl { .. }));

    clear_env();
}
