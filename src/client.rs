// src/client.rs

use crate::{
    config::AppConfig,
    error::AppResult,
    proxy::{ProxyEndpoint, socks5},
};
use async_trait::async_trait;
use reqwest::{IntoUrl, Response, header};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::{io, sync::Arc};
use tokio::net::TcpStream;

/// 带自动重试的 HTTP 客户端，绑定到一条固定的网络路径（直连或某个代理）。
#[derive(Clone)]
pub struct RobustClient {
    pub client: ClientWithMiddleware,
    raw: reqwest::Client,
    retry_policy: ExponentialBackoff,
}

impl RobustClient {
    pub fn new(config: &AppConfig, proxy: Option<&ProxyEndpoint>) -> AppResult<Self> {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(config.retry_min_backoff, config.retry_max_backoff)
            .build_with_max_retries(config.max_retries);

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(config.max_active_workers);
        builder = match proxy {
            Some(endpoint) => builder.proxy(reqwest::Proxy::all(endpoint.socks_url())?),
            None => builder.no_proxy(),
        };
        let raw = builder.build()?;

        let client = ClientBuilder::new(raw.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy.clone()))
            .build();

        Ok(Self {
            client,
            raw,
            retry_policy,
        })
    }

    /// 不经过重试中间件的底层客户端，用于需要自行控制重试的流式下载。
    pub fn raw(&self) -> &reqwest::Client {
        &self.raw
    }

    pub fn retry_policy(&self) -> &ExponentialBackoff {
        &self.retry_policy
    }

    pub async fn head<T: IntoUrl>(&self, url: T) -> AppResult<Response> {
        Ok(self.client.head(url).send().await?)
    }

    /// 只请求首字节，用于不支持 HEAD 的服务器。
    pub async fn get_first_byte<T: IntoUrl>(&self, url: T) -> AppResult<Response> {
        Ok(self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?)
    }
}

/// 一条可用于下载的网络路径。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 用于日志和界面展示的名称。
    fn label(&self) -> String;

    /// 代理名称，直连时为 `None`。
    fn proxy_name(&self) -> Option<&str>;

    fn http(&self) -> &RobustClient;

    /// 建立到目标主机的原始 TCP 连接。
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

pub struct DirectTransport {
    http: RobustClient,
}

impl DirectTransport {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            http: RobustClient::new(config, None)?,
        })
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn label(&self) -> String {
        "直连".to_string()
    }

    fn proxy_name(&self) -> Option<&str> {
        None
    }

    fn http(&self) -> &RobustClient {
        &self.http
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}

pub struct Socks5Transport {
    endpoint: ProxyEndpoint,
    http: RobustClient,
}

impl Socks5Transport {
    pub fn new(config: &AppConfig, endpoint: ProxyEndpoint) -> AppResult<Self> {
        let http = RobustClient::new(config, Some(&endpoint))?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl Transport for Socks5Transport {
    fn label(&self) -> String {
        format!("代理 {}", self.endpoint.name)
    }

    fn proxy_name(&self) -> Option<&str> {
        Some(&self.endpoint.name)
    }

    fn http(&self) -> &RobustClient {
        &self.http
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        Ok(socks5::connect(&self.endpoint, host, port).await?)
    }
}

/// 按是否指定代理构造对应的传输通道。
pub fn build_transport(
    config: &AppConfig,
    proxy: Option<&ProxyEndpoint>,
) -> AppResult<Arc<dyn Transport>> {
    Ok(match proxy {
        Some(endpoint) => Arc::new(Socks5Transport::new(config, endpoint.clone())?),
        None => Arc::new(DirectTransport::new(config)?),
    })
}
