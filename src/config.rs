use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// LUMEN instant-messaging server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "lumen-server", version, about = "LUMEN instant-messaging server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "LUMEN_PORT", default_value = "8088")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "LUMEN_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./lumen.toml")]
    pub config: String,

    /// Shared store (Redis) connection URL
    #[arg(long, env = "LUMEN_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Reader-idle timeout in seconds: a connection with no inbound traffic
    /// for this long is closed and cleaned up
    #[arg(long, env = "LUMEN_IDLE_TIMEOUT_SECS", default_value = "60")]
    pub idle_timeout_secs: u64,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "LUMEN_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8088,
            bind_address: "0.0.0.0".to_string(),
            config: "./lumen.toml".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            idle_timeout_secs: 60,
            json_logs: false,
            generate_config: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (LUMEN_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("LUMEN_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# LUMEN Instant-Messaging Server Configuration
# Place this file at ./lumen.toml or specify with --config <path>
# All settings can be overridden via environment variables (LUMEN_PORT, etc.)
# or CLI flags (--port, etc.)

# WebSocket listen port (default: 8088)
# port = 8088

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Shared store connection URL. All server instances must point at the same
# store; it is the only coordination mechanism in the cluster.
# redis_url = "redis://127.0.0.1:6379"

# Reader-idle timeout in seconds. Connections with no inbound traffic for
# this long are closed. Independent from the application-level Ping.
# idle_timeout_secs = 60

# Enable structured JSON logging for Docker/production
# json_logs = false
"#
    .to_string()
}
