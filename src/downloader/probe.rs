// src/downloader/probe.rs

use crate::{
    client::Transport,
    error::{AppError, AppResult},
    utils,
};
use log::{debug, info, warn};
use reqwest::{Response, StatusCode, header};
use std::{sync::Arc, time::Duration};

/// 资源探测结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProbeOutcome {
    pub total_size: Option<u64>,
    pub ranges_supported: bool,
    pub filename: Option<String>,
}

fn header_u64(res: &Response, name: header::HeaderName) -> Option<u64> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn disposition_filename(res: &Response) -> Option<String> {
    res.headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(utils::filename_from_content_disposition)
}

/// 通过单一传输通道探测：先 HEAD，不够确定时再发 `Range: bytes=0-0` 的 GET。
async fn probe_once(transport: &dyn Transport, url: &str) -> AppResult<ProbeOutcome> {
    let http = transport.http();
    let mut head_size = None;
    let mut filename = None;

    match http.head(url).await {
        Ok(res) if res.status().is_success() => {
            head_size = header_u64(&res, header::CONTENT_LENGTH);
            filename = disposition_filename(&res);
            let accepts_bytes = res
                .headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"));
            if accepts_bytes && head_size.is_some_and(|s| s > 0) {
                debug!("HEAD 探测成功: 大小 {:?}，支持 Range", head_size);
                return Ok(ProbeOutcome {
                    total_size: head_size,
                    ranges_supported: true,
                    filename,
                });
            }
        }
        Ok(res) => debug!("HEAD 请求返回 {}，改用 GET 探测", res.status()),
        Err(e) => debug!("HEAD 请求失败，改用 GET 探测: {}", e),
    }

    let res = http.get_first_byte(url).await?;
    let status = res.status();
    if filename.is_none() {
        filename = disposition_filename(&res);
    }
    match status {
        StatusCode::PARTIAL_CONTENT => {
            let total = res
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(utils::parse_content_range)
                .and_then(|(_, _, total)| total)
                .or(head_size);
            Ok(ProbeOutcome {
                total_size: total,
                ranges_supported: total.is_some(),
                filename,
            })
        }
        // 空文件对 bytes=0-0 通常返回 416
        StatusCode::RANGE_NOT_SATISFIABLE => Ok(ProbeOutcome {
            total_size: head_size,
            ranges_supported: false,
            filename,
        }),
        s if s.is_success() => {
            info!("服务器忽略了 Range 请求，将使用单线程下载");
            Ok(ProbeOutcome {
                total_size: header_u64(&res, header::CONTENT_LENGTH).or(head_size),
                ranges_supported: false,
                filename,
            })
        }
        s => Err(AppError::ProbeFailed(format!("服务器返回状态码 {}", s))),
    }
}

/// 依次尝试各传输通道，第一个成功的结果生效。
pub(crate) async fn probe(
    url: &str,
    transports: &[Arc<dyn Transport>],
    timeout: Duration,
) -> AppResult<ProbeOutcome> {
    let mut last_error = String::from("没有可用的网络通道");
    for transport in transports {
        match tokio::time::timeout(timeout, probe_once(transport.as_ref(), url)).await {
            Ok(Ok(outcome)) => {
                info!(
                    "通过{}探测 '{}' 成功: 大小 {:?}, Range 支持: {}",
                    transport.label(),
                    url,
                    outcome.total_size,
                    outcome.ranges_supported
                );
                return Ok(outcome);
            }
            Ok(Err(e)) => {
                warn!("通过{}探测失败: {}", transport.label(), e);
                last_error = e.to_string();
            }
            Err(_) => {
                warn!("通过{}探测超时 ({:?})", transport.label(), timeout);
                last_error = format!("{} 超时", transport.label());
            }
        }
    }
    Err(AppError::ProbeFailed(last_error))
}
