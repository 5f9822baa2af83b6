// src/constants.rs

/// Name of the application, used for config and data directories.
pub const APP_NAME: &str = "strata";

/// Semantic version printed by `strata version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Definition files are named `env_<stage>.toml`.
pub const DEFINITION_PREFIX: &str = "env_";
pub const DEFINITION_EXTENSION: &str = "toml";

/// The inheritance root stage.
pub const COMM_STAGE: &str = "comm";

/// Stage scaffolded by `init` when none is given.
pub const DEFAULT_INIT_STAGE: &str = COMM_STAGE;

/// Prefix of the dot-env dump written by `strata dump` (`.env_<stage>`).
pub const DUMP_PREFIX: &str = ".env_";

/// The user settings file (inside the config dir).
pub const SETTINGS_FILENAME: &str = "settings.toml";

/// The shell history file (inside a project's data dir).
pub const HISTORY_FILENAME: &str = "history";

/// Name of the placeholder environment loaded in Emergency mode.
pub const EMERGENCY_ENV_NAME: &str = "emergency";

/// Name of the synthetic module holding a definition's expression scope.
pub const DEFINITION_SCOPE_MODULE: &str = "<definition>";

/// Hex characters kept from the blake3 hash of a definition path.
pub const DATA_DIR_HASH_LENGTH: usize = 16;

// --- Environment variables ---

pub const ENV_DEBUG: &str = "STRATA_DEBUG";
pub const ENV_SESSION: &str = "STRATA_SESSION";
pub const ENV_TEST_INTROSPECT: &str = "STRATA_TEST_INTROSPECT";
pub const ENV_TEST_STATE_FILE: &str = "STRATA_TEST_STATE_FILE";

// --- Supervisor defaults ---

pub const DEFAULT_DEBOUNCE_MS: u64 = 200;
pub const DEFAULT_RELOAD_TIMEOUT_SECS: u64 = 10;
pub const LOADING_GLYPH: &str = "⏳";
pub const EMERGENCY_GLYPH: &str = "❌";

// --- Watcher defaults ---

/// Glob every definition directory is watched with.
pub const DEFINITION_GLOB: &str = "env_*.toml";
/// Glob of script modules under a sources root.
pub const SOURCES_GLOB: &str = "**/*.stm";
/// Hidden files, editor swap files and cache directories.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.*",
    "**/.*/**",
    "**/*~",
    "**/*.swp",
    "**/*.swx",
    "**/#*#",
    "**/__pycache__/**",
    "**/target/**",
    "**/node_modules/**",
];
