// src/config.rs

pub mod store;

use self::store::{get_config_path, load_or_create_external_config};
use crate::{cli::Cli, constants, error::AppResult, proxy::ProxyEndpoint};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub proxy_test_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_min_backoff_ms: Option<u64>,
    pub retry_max_backoff_ms: Option<u64>,
    pub user_agent: Option<String>,
    /// 代理测试时 CONNECT 的目标，格式为 `host:port`。
    pub proxy_probe_target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DownloadConfig {
    pub default_thread_count: Option<usize>,
    pub max_active_workers: Option<usize>,
    pub max_reassignments: Option<u32>,
    pub checkpoint_bytes: Option<u64>,
    pub checkpoint_interval_ms: Option<u64>,
    pub progress_interval_ms: Option<u64>,
}

/// `~/.multisocks-dl/config.json` 的文件内容。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExternalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub proxies: Vec<ProxyEndpoint>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

impl ExternalConfig {
    pub(crate) fn default_app_config() -> Self {
        // 为首次运行写出一份完整的默认值，方便用户直接编辑
        let network = NetworkConfig {
            connect_timeout_secs: Some(constants::DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout_secs: Some(constants::DEFAULT_READ_TIMEOUT_SECS),
            probe_timeout_secs: Some(constants::DEFAULT_PROBE_TIMEOUT_SECS),
            proxy_test_timeout_secs: Some(constants::DEFAULT_PROXY_TEST_TIMEOUT_SECS),
            max_retries: Some(constants::DEFAULT_MAX_RETRIES),
            retry_min_backoff_ms: Some(500),
            retry_max_backoff_ms: Some(10_000),
            user_agent: Some(constants::USER_AGENT.to_string()),
            proxy_probe_target: Some(constants::DEFAULT_PROXY_PROBE_TARGET.to_string()),
        };
        let download = DownloadConfig {
            default_thread_count: Some(constants::DEFAULT_THREAD_COUNT),
            max_active_workers: Some(constants::DEFAULT_MAX_ACTIVE_WORKERS),
            max_reassignments: Some(constants::DEFAULT_MAX_REASSIGNMENTS),
            checkpoint_bytes: Some(constants::DEFAULT_CHECKPOINT_BYTES),
            checkpoint_interval_ms: Some(constants::DEFAULT_CHECKPOINT_INTERVAL_MS),
            progress_interval_ms: Some(constants::DEFAULT_PROGRESS_INTERVAL_MS),
        };
        Self {
            save_dir: None,
            state_dir: None,
            proxies: Vec::new(),
            network,
            download,
        }
    }
}

/// 运行时使用的配置，由配置文件与命令行参数合并而来。
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// 代理增删后写回的配置文件；为 `None` 时仅在内存中生效。
    pub config_path: Option<PathBuf>,
    pub save_dir: PathBuf,
    pub state_dir: PathBuf,
    pub proxies: Vec<ProxyEndpoint>,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub probe_timeout: Duration,
    pub proxy_test_timeout: Duration,
    pub max_retries: u32,
    pub retry_min_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub proxy_probe_target: String,
    pub default_thread_count: usize,
    pub max_active_workers: usize,
    pub max_reassignments: u32,
    pub checkpoint_bytes: u64,
    pub checkpoint_interval: Duration,
    pub progress_interval: Duration,
}

impl AppConfig {
    pub fn new(args: &Cli) -> AppResult<Self> {
        let config_path = get_config_path()?;
        let external_config = load_or_create_external_config(&config_path)?;
        let mut config = Self::from_external(external_config, Some(config_path));

        if let Some(output) = &args.output {
            config.save_dir = output.clone();
        }
        if let Some(workers) = args.workers {
            config.max_active_workers = workers.max(1);
        }
        if let Some(threads) = args.threads {
            config.default_thread_count = threads.clamp(1, constants::MAX_THREADS_PER_TASK);
        }
        Ok(config)
    }

    pub fn from_external(external: ExternalConfig, config_path: Option<PathBuf>) -> Self {
        let config_dir = config_path
            .as_ref()
            .and_then(|p| p.parent().map(PathBuf::from))
            .unwrap_or_else(|| std::env::temp_dir().join(clap::crate_name!()));
        let net = external.network;
        let dl = external.download;

        Self {
            save_dir: external.save_dir.unwrap_or_else(|| {
                dirs::download_dir().unwrap_or_else(|| PathBuf::from(constants::DEFAULT_SAVE_DIR))
            }),
            state_dir: external
                .state_dir
                .unwrap_or_else(|| config_dir.join(constants::STATE_DIR_NAME)),
            config_path,
            proxies: external.proxies,
            user_agent: net.user_agent.unwrap_or_else(|| constants::USER_AGENT.into()),
            connect_timeout: Duration::from_secs(
                net.connect_timeout_secs.unwrap_or(constants::DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            read_timeout: Duration::from_secs(
                net.read_timeout_secs.unwrap_or(constants::DEFAULT_READ_TIMEOUT_SECS),
            ),
            probe_timeout: Duration::from_secs(
                net.probe_timeout_secs.unwrap_or(constants::DEFAULT_PROBE_TIMEOUT_SECS),
            ),
            proxy_test_timeout: Duration::from_secs(
                net.proxy_test_timeout_secs.unwrap_or(constants::DEFAULT_PROXY_TEST_TIMEOUT_SECS),
            ),
            max_retries: net.max_retries.unwrap_or(constants::DEFAULT_MAX_RETRIES),
            retry_min_backoff: Duration::from_millis(net.retry_min_backoff_ms.unwrap_or(500)),
            retry_max_backoff: Duration::from_millis(net.retry_max_backoff_ms.unwrap_or(10_000)),
            proxy_probe_target: net
                .proxy_probe_target
                .unwrap_or_else(|| constants::DEFAULT_PROXY_PROBE_TARGET.into()),
            default_thread_count: dl
                .default_thread_count
                .unwrap_or(constants::DEFAULT_THREAD_COUNT)
                .clamp(1, constants::MAX_THREADS_PER_TASK),
            max_active_workers: dl
                .max_active_workers
                .unwrap_or(constants::DEFAULT_MAX_ACTIVE_WORKERS)
                .max(1),
            max_reassignments: dl.max_reassignments.unwrap_or(constants::DEFAULT_MAX_REASSIGNMENTS),
            checkpoint_bytes: dl
                .checkpoint_bytes
                .unwrap_or(constants::DEFAULT_CHECKPOINT_BYTES)
                .max(1),
            checkpoint_interval: Duration::from_millis(
                dl.checkpoint_interval_ms.unwrap_or(constants::DEFAULT_CHECKPOINT_INTERVAL_MS),
            ),
            progress_interval: Duration::from_millis(
                dl.progress_interval_ms.unwrap_or(constants::DEFAULT_PROGRESS_INTERVAL_MS),
            ),
        }
    }
}

#[cfg(feature = "testing")]
impl Default for AppConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join(format!("{}-test", clap::crate_name!()));
        Self {
            config_path: None,
            save_dir: base.join("downloads"),
            state_dir: base.join("tasks"),
            proxies: Vec::new(),
            user_agent: "test-agent/1.0".to_string(),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            proxy_test_timeout: Duration::from_secs(2),
            max_retries: 1,
            retry_min_backoff: Duration::from_millis(10),
            retry_max_backoff: Duration::from_millis(50),
            proxy_probe_target: "127.0.0.1:80".to_string(),
            default_thread_count: 4,
            max_active_workers: 8,
            max_reassignments: 3,
            checkpoint_bytes: 16 * 1024,
            checkpoint_interval: Duration::from_millis(100),
            progress_interval: Duration::from_millis(50),
        }
    }
}
