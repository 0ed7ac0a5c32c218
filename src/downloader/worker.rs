// src/downloader/worker.rs

use crate::{
    client::Transport,
    error::AppError,
    models::{FailureCause, Segment},
    utils,
};
use futures::StreamExt;
use log::{debug, trace, warn};
use reqwest::{StatusCode, header};
use reqwest_retry::{RetryDecision, RetryPolicy};
use std::{
    io::SeekFrom,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{Semaphore, mpsc},
};
use tokio_util::sync::CancellationToken;

/// 分片工作者发回调度器的消息。
#[derive(Debug)]
pub(crate) enum WorkerMsg {
    /// 新增已落盘（已 sync）的字节数。
    Progress { index: usize, delta: u64 },
    /// 服务器不支持续传，分片从头重新下载。
    Rewound { index: usize },
    Done { index: usize },
    Failed { index: usize, error: AppError },
    RangeUnsupported { index: usize },
    Stopped { index: usize },
}

enum FetchOutcome {
    Completed,
    Stopped,
    RangeIgnored,
}

enum FetchError {
    Retryable(AppError),
    Fatal(AppError),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Fatal(AppError::Io(e))
    }
}

fn classify_status(err: reqwest::Error) -> FetchError {
    let retryable = err.status().is_some_and(|s| {
        s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS || s == StatusCode::REQUEST_TIMEOUT
    });
    if retryable {
        FetchError::Retryable(AppError::Network(err))
    } else {
        FetchError::Fatal(AppError::Network(err))
    }
}

pub(crate) struct SegmentWorker {
    pub task_id: String,
    pub url: String,
    pub segment: Segment,
    pub total_size: Option<u64>,
    pub path: PathBuf,
    pub transport: Arc<dyn Transport>,
    pub checkpoint_bytes: u64,
    pub permits: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub tx: mpsc::Sender<WorkerMsg>,
}

impl SegmentWorker {
    fn index(&self) -> usize {
        self.segment.index
    }

    async fn send(&self, msg: WorkerMsg) {
        if self.tx.send(msg).await.is_err() {
            trace!("任务 {} 的调度器已退出，丢弃分片消息", self.task_id);
        }
    }

    /// 该请求是否覆盖整个资源，此时服务器返回 200 也可以接受。
    fn covers_whole_resource(&self) -> bool {
        self.segment.start == 0 && (self.segment.end.is_none() || self.segment.end == self.total_size)
    }

    pub(crate) async fn run(mut self) {
        let index = self.index();
        // 全局并发上限
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.send(WorkerMsg::Stopped { index }).await;
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    self.send(WorkerMsg::Stopped { index }).await;
                    return;
                }
            },
        };

        debug!(
            "任务 {} 分片 {} 开始下载 ({}), {}",
            self.task_id,
            index,
            self.transport.label(),
            self.segment.range_header()
        );

        let started = SystemTime::now();
        let mut n_past_retries = 0;
        loop {
            let error = match self.fetch().await {
                Ok(FetchOutcome::Completed) => {
                    self.send(WorkerMsg::Done { index }).await;
                    return;
                }
                Ok(FetchOutcome::Stopped) => {
                    self.send(WorkerMsg::Stopped { index }).await;
                    return;
                }
                Ok(FetchOutcome::RangeIgnored) => {
                    self.send(WorkerMsg::RangeUnsupported { index }).await;
                    return;
                }
                Err(FetchError::Fatal(error)) => {
                    self.send(WorkerMsg::Failed { index, error }).await;
                    return;
                }
                Err(FetchError::Retryable(error)) => error,
            };

            let decision = self
                .transport
                .http()
                .retry_policy()
                .should_retry(started, n_past_retries);
            match decision {
                RetryDecision::Retry { execute_after } => {
                    let wait = execute_after
                        .duration_since(SystemTime::now())
                        .unwrap_or_default();
                    warn!(
                        "任务 {} 分片 {} 第 {} 次重试 ({:?} 后): {}",
                        self.task_id,
                        index,
                        n_past_retries + 1,
                        wait,
                        error
                    );
                    n_past_retries += 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.send(WorkerMsg::Stopped { index }).await;
                            return;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                RetryDecision::DoNotRetry => {
                    self.send(WorkerMsg::Failed { index, error }).await;
                    return;
                }
            }
        }
    }

    async fn open_file(&self) -> Result<File, FetchError> {
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|source| {
                FetchError::Fatal(AppError::DestinationUnwritable {
                    path: self.path.display().to_string(),
                    source,
                })
            })
    }

    /// 刷盘后再上报，记录中的进度永远不超过已落盘的字节。
    async fn commit(&mut self, file: &mut File, pending: &mut u64) -> Result<(), FetchError> {
        if *pending == 0 {
            return Ok(());
        }
        file.flush().await?;
        file.sync_data().await?;
        self.segment.record_written(*pending);
        let delta = std::mem::take(pending);
        self.send(WorkerMsg::Progress {
            index: self.index(),
            delta,
        })
        .await;
        Ok(())
    }

    /// 单次请求尝试。
    async fn fetch(&mut self) -> Result<FetchOutcome, FetchError> {
        if self.cancel.is_cancelled() {
            return Ok(FetchOutcome::Stopped);
        }
        if self.segment.remaining() == Some(0) {
            return Ok(FetchOutcome::Completed);
        }

        let request = self
            .transport
            .http()
            .raw()
            .get(&self.url)
            .header(header::RANGE, self.segment.range_header());
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(FetchOutcome::Stopped),
            res = request.send() => res,
        };
        let res = res.map_err(|e| FetchError::Retryable(AppError::Network(e)))?;

        match res.status() {
            StatusCode::PARTIAL_CONTENT => {
                let range = res
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(utils::parse_content_range);
                match range {
                    Some((start, _, _)) if start == self.segment.offset() => {}
                    other => {
                        warn!(
                            "任务 {} 分片 {} 的 Content-Range 不匹配: {:?} (期望起点 {})",
                            self.task_id,
                            self.index(),
                            other,
                            self.segment.offset()
                        );
                        return Ok(FetchOutcome::RangeIgnored);
                    }
                }
            }
            StatusCode::OK if self.covers_whole_resource() => {
                if self.segment.bytes_written > 0 {
                    debug!("任务 {} 服务器返回完整内容，从头写入", self.task_id);
                    self.segment.reset();
                    self.send(WorkerMsg::Rewound { index: self.index() }).await;
                }
            }
            StatusCode::OK => return Ok(FetchOutcome::RangeIgnored),
            status => {
                debug!("任务 {} 分片 {} 收到状态码 {}", self.task_id, self.index(), status);
                let index = self.index();
                return Err(res.error_for_status().err().map(classify_status).unwrap_or(
                    FetchError::Fatal(AppError::SegmentFailed {
                        index,
                        cause: FailureCause::ServerError,
                    }),
                ));
            }
        }

        let mut file = self.open_file().await?;
        file.seek(SeekFrom::Start(self.segment.offset())).await?;

        let mut stream = res.bytes_stream();
        let mut pending: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.commit(&mut file, &mut pending).await?;
                    return Ok(FetchOutcome::Stopped);
                }
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    self.commit(&mut file, &mut pending).await?;
                    return Err(FetchError::Retryable(AppError::Network(e)));
                }
                None => break,
            };

            // 服务器多发的数据直接丢弃，不越过分片边界
            let mut data = &chunk[..];
            if let Some(remaining) = self.segment.remaining() {
                let room = remaining.saturating_sub(pending);
                if (data.len() as u64) > room {
                    data = &data[..room as usize];
                }
            }
            file.write_all(data).await?;
            pending += data.len() as u64;

            if pending >= self.checkpoint_bytes {
                self.commit(&mut file, &mut pending).await?;
            }
            if self.segment.remaining().is_some_and(|r| r == pending) {
                break;
            }
        }
        self.commit(&mut file, &mut pending).await?;

        match self.segment.remaining() {
            Some(0) | None => Ok(FetchOutcome::Completed),
            Some(_) => {
                let expected = self.segment.len().unwrap_or_default();
                Err(FetchError::Retryable(AppError::Truncated {
                    expected,
                    actual: self.segment.bytes_written,
                }))
            }
        }
    }
}
