//! Environment variable based configuration.

use std::env;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    #[allow(dead_code)]
    pub cors_origins: Vec<String>,
    pub data_dir: PathBuf,
    pub auth_secret: String,
    pub room: RoomConfig,
    pub executor: ExecutorConfig,
    pub log_level: String,
}

/// Defaults for the room created at startup. Persisted settings, when
/// present, override these.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub id: String,
    pub name: String,
    pub capacity: usize,
    pub min_players_to_start: usize,
    pub round_duration_ms: u64,
    pub welcome_message: Option<String>,
}

/// Submission execution settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub python_bin: String,
    pub cpp_compiler: String,
    pub work_root: PathBuf,
    pub timeout_ms: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "5604".to_string())
                .parse()
                .unwrap_or(5604),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3600".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            auth_secret: env::var("AUTH_SECRET").unwrap_or_default(),
            room: RoomConfig {
                id: env::var("ROOM_ID").unwrap_or_else(|_| "123456".to_string()),
                name: env::var("ROOM_NAME").unwrap_or_else(|_| "GridCode Arena".to_string()),
                capacity: env::var("ROOM_CAPACITY")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                min_players_to_start: env::var("MIN_PLAYERS_TO_START")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                round_duration_ms: env::var("ROUND_DURATION_MS")
                    .unwrap_or_else(|_| "180000".to_string())
                    .parse()
                    .unwrap_or(180_000),
                welcome_message: env::var("WELCOME_MESSAGE").ok().filter(|m| !m.is_empty()),
            },
            executor: ExecutorConfig {
                python_bin: env::var("PYTHON_BIN").unwrap_or_else(|_| "python3".to_string()),
                cpp_compiler: env::var("CPP_COMPILER").unwrap_or_else(|_| "g++".to_string()),
                work_root: env::var("EXEC_WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| env::temp_dir().join("gridcode-submissions")),
                timeout_ms: env::var("EXEC_TIMEOUT_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .unwrap_or(5_000),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}
