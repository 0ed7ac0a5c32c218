// src/constants.rs

pub const UI_WIDTH: usize = 88;
pub const FILENAME_TRUNCATE_LENGTH: usize = 50;
pub const MAX_FILENAME_BYTES: usize = 200;
pub const CONFIG_DIR_NAME: &str = concat!(".", clap::crate_name!());
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LOG_FILE_NAME: &str = concat!(clap::crate_name!(), ".log");
pub const LOG_FALLBACK_FILE_NAME: &str = "fallback.log";
pub const STATE_DIR_NAME: &str = "tasks";
pub const DEFAULT_SAVE_DIR: &str = "downloads";
pub const DEFAULT_FILENAME: &str = "download_file";
pub const PARTIAL_SUFFIX: &str = ".downloading";
pub const RECORD_VERSION: u32 = 1;
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const DEFAULT_THREAD_COUNT: usize = 10;
pub const MAX_THREADS_PER_TASK: usize = 32;
pub const DEFAULT_MAX_ACTIVE_WORKERS: usize = 32;
pub const DEFAULT_MAX_REASSIGNMENTS: u32 = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_PROXY_TEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROXY_PROBE_TARGET: &str = "www.google.com:80";

/// 速度估算的滑动窗口长度（秒）。
pub const THROUGHPUT_WINDOW_SECS: f64 = 5.0;
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
