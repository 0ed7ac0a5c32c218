// src/proxy/mod.rs

pub mod socks5;

use crate::{
    client::{Transport, build_transport},
    config::{self, AppConfig},
    error::{AppError, AppResult},
    utils,
};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

/// 一个 SOCKS5 代理端点。名称在注册表内唯一。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(name: &str, host: &str, port: u16) -> AppResult<Self> {
        let endpoint = Self {
            name: name.trim().to_string(),
            host: host.trim().to_string(),
            port,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AppError::InvalidProxy("代理名称不能为空".to_string()));
        }
        if self.host.is_empty() {
            return Err(AppError::InvalidProxy(format!("代理 '{}' 缺少主机地址", self.name)));
        }
        if self.port == 0 {
            return Err(AppError::InvalidProxy(format!("代理 '{}' 的端口不能为 0", self.name)));
        }
        Ok(())
    }

    /// 供 reqwest 使用的代理地址，域名交由代理端解析。
    pub fn socks_url(&self) -> String {
        if self.host.contains(':') {
            format!("socks5h://[{}]:{}", self.host, self.port)
        } else {
            format!("socks5h://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyFailureKind {
    ConnectTimeout,
    HandshakeRejected,
    RefusedConnection,
}

impl fmt::Display for ProxyFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyFailureKind::ConnectTimeout => "连接超时",
            ProxyFailureKind::HandshakeRejected => "握手被拒绝",
            ProxyFailureKind::RefusedConnection => "连接被拒绝",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    #[default]
    Untested,
    Reachable { latency_ms: u64 },
    Unreachable { kind: ProxyFailureKind },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTestResult {
    pub name: String,
    pub reachable: bool,
    pub latency: Option<Duration>,
    pub failure: Option<ProxyFailureKind>,
}

impl ProxyTestResult {
    pub fn liveness(&self) -> Liveness {
        match (self.failure, self.latency) {
            (Some(kind), _) => Liveness::Unreachable { kind },
            (None, Some(latency)) => Liveness::Reachable {
                latency_ms: latency.as_millis() as u64,
            },
            (None, None) => Liveness::Untested,
        }
    }
}

/// 代理注册表。读取方拿到的是快照，增删操作整体替换列表。
pub struct ProxyRegistry {
    endpoints: RwLock<Arc<Vec<ProxyEndpoint>>>,
    liveness: DashMap<String, Liveness>,
    config_path: Option<PathBuf>,
}

impl ProxyRegistry {
    pub fn new(endpoints: Vec<ProxyEndpoint>, config_path: Option<PathBuf>) -> Self {
        let mut unique: Vec<ProxyEndpoint> = Vec::with_capacity(endpoints.len());
        for ep in endpoints {
            if let Err(e) = ep.validate() {
                warn!("忽略配置中的无效代理: {}", e);
            } else if unique.iter().any(|u| u.name == ep.name) {
                warn!("忽略配置中重复的代理名称: {}", ep.name);
            } else {
                unique.push(ep);
            }
        }
        info!("代理注册表已加载 {} 个代理", unique.len());
        Self {
            endpoints: RwLock::new(Arc::new(unique)),
            liveness: DashMap::new(),
            config_path,
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<ProxyEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn list(&self) -> Vec<(ProxyEndpoint, Liveness)> {
        self.snapshot()
            .iter()
            .map(|ep| (ep.clone(), self.liveness(&ep.name)))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ProxyEndpoint> {
        self.snapshot().iter().find(|ep| ep.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// 未被标记为不可达的代理，按配置顺序排列。
    pub fn available(&self) -> Vec<ProxyEndpoint> {
        self.snapshot()
            .iter()
            .filter(|ep| !matches!(self.liveness(&ep.name), Liveness::Unreachable { .. }))
            .cloned()
            .collect()
    }

    pub fn liveness(&self, name: &str) -> Liveness {
        self.liveness.get(name).map(|l| *l).unwrap_or_default()
    }

    pub fn mark(&self, name: &str, liveness: Liveness) {
        debug!("代理 '{}' 状态更新为 {:?}", name, liveness);
        self.liveness.insert(name.to_string(), liveness);
    }

    pub fn add(&self, endpoint: ProxyEndpoint) -> AppResult<()> {
        endpoint.validate()?;
        let mut guard = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        if guard.iter().any(|ep| ep.name == endpoint.name) {
            return Err(AppError::DuplicateName(endpoint.name));
        }
        let mut next = guard.as_ref().clone();
        info!("添加代理: {}", endpoint);
        next.push(endpoint);
        self.persist(&next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// 移除代理。正在使用该代理的分片不受影响，但之后不会再被分配到它。
    pub fn remove(&self, name: &str) -> AppResult<ProxyEndpoint> {
        let mut guard = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        let pos = guard
            .iter()
            .position(|ep| ep.name == name)
            .ok_or_else(|| AppError::ProxyNotFound(name.to_string()))?;
        let mut next = guard.as_ref().clone();
        let removed = next.remove(pos);
        self.persist(&next)?;
        *guard = Arc::new(next);
        self.liveness.remove(name);
        info!("已移除代理: {}", removed);
        Ok(removed)
    }

    fn persist(&self, endpoints: &[ProxyEndpoint]) -> AppResult<()> {
        match &self.config_path {
            Some(path) => config::store::save_proxies(path, endpoints),
            None => Ok(()),
        }
    }

    /// 通过给定通道向 `target` 建立一次连接。网络失败体现在结果中，不作为错误返回。
    pub async fn check(transport: &dyn Transport, target: &str, timeout: Duration) -> AppResult<ProxyTestResult> {
        let (host, port) = utils::split_host_port(target)?;
        let name = transport
            .proxy_name()
            .map(String::from)
            .unwrap_or_else(|| transport.label());
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, transport.connect(&host, port)).await;
        let failure = match outcome {
            Ok(Ok(_stream)) => None,
            Ok(Err(e)) => {
                debug!("'{}' 连接测试失败: {}", name, e);
                Some(socks5::failure_kind_of(&e))
            }
            Err(_) => Some(ProxyFailureKind::ConnectTimeout),
        };
        Ok(ProxyTestResult {
            name,
            reachable: failure.is_none(),
            latency: failure.is_none().then(|| started.elapsed()),
            failure,
        })
    }

    /// 测试指定代理并记录其可达性，目标与超时取自配置。
    pub async fn test(&self, config: &AppConfig, name: &str) -> AppResult<ProxyTestResult> {
        let endpoint = self
            .get(name)
            .ok_or_else(|| AppError::ProxyNotFound(name.to_string()))?;
        let transport = build_transport(config, Some(&endpoint))?;
        let result =
            Self::check(transport.as_ref(), &config.proxy_probe_target, config.proxy_test_timeout).await?;
        self.mark(name, result.liveness());
        Ok(result)
    }

    /// 并发测试全部代理。
    pub async fn test_all(&self, config: &AppConfig) -> AppResult<Vec<ProxyTestResult>> {
        let transports = self
            .snapshot()
            .iter()
            .map(|ep| build_transport(config, Some(ep)))
            .collect::<AppResult<Vec<_>>>()?;
        let results = join_all(transports.iter().map(|transport| {
            Self::check(transport.as_ref(), &config.proxy_probe_target, config.proxy_test_timeout)
        }))
        .await
        .into_iter()
        .collect::<AppResult<Vec<_>>>()?;
        for result in &results {
            self.mark(&result.name, result.liveness());
        }
        Ok(results)
    }
}
