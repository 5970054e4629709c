use aoc_remote_storage::message_log::{DEFAULT_SEGMENT_MAX_BYTES, DEFAULT_SEGMENT_MAX_MESSAGES};
use aoc_remote_storage::RotationPolicy;
use clap::Parser;
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub data_dir: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub rate_limit_per_ip: usize,
    pub rate_window: Duration,
    pub max_message_bytes: usize,
    pub max_projects: usize,
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub broadcast_timeout: Duration,
    pub stats_interval: Duration,
    pub shutdown_grace: Duration,
    pub queue_capacity: usize,
    pub allowed_origins: Vec<String>,
    pub claude_bin: String,
    pub rotation: RotationPolicy,
}

impl HubConfig {
    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            addr: "127.0.0.1:8765".to_string(),
            log_dir: data_dir.join("logs").to_string_lossy().to_string(),
            data_dir,
            debug: false,
            max_connections: 100,
            max_connections_per_ip: 10,
            rate_limit_per_ip: 20,
            rate_window: Duration::from_secs(60),
            max_message_bytes: 1024 * 1024,
            max_projects: 100,
            read_timeout: Duration::from_secs(90),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            broadcast_timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            queue_capacity: 256,
            allowed_origins: Vec::new(),
            claude_bin: "claude".to_string(),
            rotation: RotationPolicy {
                max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
                max_messages: DEFAULT_SEGMENT_MAX_MESSAGES,
            },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "aoc-remote-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    data_dir: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long)]
    max_connections: Option<usize>,
    #[arg(long)]
    max_connections_per_ip: Option<usize>,
    #[arg(long)]
    rate_limit_per_ip: Option<usize>,
    #[arg(long)]
    rate_window: Option<u64>,
    #[arg(long)]
    max_message_bytes: Option<usize>,
    #[arg(long)]
    max_projects: Option<usize>,
    #[arg(long)]
    read_timeout: Option<u64>,
    #[arg(long)]
    ping_interval: Option<u64>,
    #[arg(long)]
    pong_timeout: Option<u64>,
    #[arg(long)]
    write_timeout: Option<u64>,
    #[arg(long)]
    broadcast_timeout: Option<u64>,
    #[arg(long)]
    stats_interval: Option<u64>,
    #[arg(long)]
    shutdown_grace: Option<u64>,
    /// Comma separated list of accepted Origin header values.
    #[arg(long, default_value = "")]
    allowed_origins: String,
    #[arg(long, default_value = "")]
    claude_bin: String,
    #[arg(long)]
    segment_max_bytes: Option<u64>,
    #[arg(long)]
    segment_max_messages: Option<usize>,
}

pub fn load_config() -> HubConfig {
    let args = Args::parse();
    let defaults = HubConfig::default();

    let data_dir = PathBuf::from(resolve_str(
        &args.data_dir,
        "AOC_REMOTE_DATA_DIR",
        &defaults.data_dir.to_string_lossy(),
    ));
    let log_dir = resolve_str(
        &args.log_dir,
        "AOC_REMOTE_LOG_DIR",
        &data_dir.join("logs").to_string_lossy(),
    );
    let origins = resolve_str(&args.allowed_origins, "AOC_REMOTE_ALLOWED_ORIGINS", "");

    HubConfig {
        addr: resolve_str(&args.addr, "AOC_REMOTE_ADDR", &defaults.addr),
        data_dir,
        log_dir,
        debug: args.debug || env_true("AOC_REMOTE_DEBUG"),
        max_connections: resolve_num(
            args.max_connections,
            "AOC_REMOTE_MAX_CONNECTIONS",
            defaults.max_connections,
        ),
        max_connections_per_ip: resolve_num(
            args.max_connections_per_ip,
            "AOC_REMOTE_MAX_CONNECTIONS_PER_IP",
            defaults.max_connections_per_ip,
        ),
        rate_limit_per_ip: resolve_num(
            args.rate_limit_per_ip,
            "AOC_REMOTE_RATE_LIMIT_PER_IP",
            defaults.rate_limit_per_ip,
        ),
        rate_window: resolve_secs(args.rate_window, "AOC_REMOTE_RATE_WINDOW", defaults.rate_window),
        max_message_bytes: resolve_num(
            args.max_message_bytes,
            "AOC_REMOTE_MAX_MESSAGE_BYTES",
            defaults.max_message_bytes,
        ),
        max_projects: resolve_num(args.max_projects, "AOC_REMOTE_MAX_PROJECTS", defaults.max_projects),
        read_timeout: resolve_secs(
            args.read_timeout,
            "AOC_REMOTE_READ_TIMEOUT",
            defaults.read_timeout,
        ),
        ping_interval: resolve_secs(
            args.ping_interval,
            "AOC_REMOTE_PING_INTERVAL",
            defaults.ping_interval,
        ),
        pong_timeout: resolve_secs(
            args.pong_timeout,
            "AOC_REMOTE_PONG_TIMEOUT",
            defaults.pong_timeout,
        ),
        write_timeout: resolve_secs(
            args.write_timeout,
            "AOC_REMOTE_WRITE_TIMEOUT",
            defaults.write_timeout,
        ),
        broadcast_timeout: resolve_secs(
            args.broadcast_timeout,
            "AOC_REMOTE_BROADCAST_TIMEOUT",
            defaults.broadcast_timeout,
        ),
        stats_interval: resolve_secs(
            args.stats_interval,
            "AOC_REMOTE_STATS_INTERVAL",
            defaults.stats_interval,
        ),
        shutdown_grace: resolve_secs(
            args.shutdown_grace,
            "AOC_REMOTE_SHUTDOWN_GRACE",
            defaults.shutdown_grace,
        ),
        queue_capacity: defaults.queue_capacity,
        allowed_origins: parse_origins(&origins),
        claude_bin: resolve_str(&args.claude_bin, "AOC_REMOTE_CLAUDE_BIN", &defaults.claude_bin),
        rotation: RotationPolicy {
            max_bytes: resolve_num(
                args.segment_max_bytes,
                "AOC_REMOTE_SEGMENT_MAX_BYTES",
                defaults.rotation.max_bytes,
            ),
            max_messages: resolve_num(
                args.segment_max_messages,
                "AOC_REMOTE_SEGMENT_MAX_MESSAGES",
                defaults.rotation.max_messages,
            ),
        },
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aoc-remote")
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_str(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_num<T: FromStr>(flag: Option<T>, env_key: &str, default: T) -> T {
    if let Some(value) = flag {
        return value;
    }
    std::env::var(env_key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn resolve_secs(flag: Option<u64>, env_key: &str, default: Duration) -> Duration {
    Duration::from_secs(resolve_num(flag, env_key, default.as_secs()))
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().trim_end_matches('/').to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_trimmed_and_normalized() {
        assert_eq!(
            parse_origins(" https://app.example.com/ ,,http://localhost:5173"),
            vec![
                "https://app.example.com".to_string(),
                "http://localhost:5173".to_string()
            ]
        );
        assert!(parse_origins("").is_empty());
    }

    #[test]
    fn flag_wins_over_env_and_default() {
        assert_eq!(resolve_num(Some(7usize), "AOC_REMOTE_TEST_UNSET_NUM", 3), 7);
        assert_eq!(resolve_num(None, "AOC_REMOTE_TEST_UNSET_NUM", 3usize), 3);
        assert_eq!(
            resolve_str("flag", "AOC_REMOTE_TEST_UNSET_STR", "default"),
            "flag"
        );
        assert_eq!(
            resolve_str("  ", "AOC_REMOTE_TEST_UNSET_STR", "default"),
            "default"
        );
    }

    #[test]
    fn projects_live_under_data_dir() {
        let config = HubConfig {
            data_dir: PathBuf::from("/srv/aoc"),
            ..HubConfig::default()
        };
        assert_eq!(config.projects_dir(), PathBuf::from("/srv/aoc/projects"));
    }
}
