// src/error.rs

use crate::models::FailureCause;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("探测失败，无法确定资源大小: {0}")]
    ProbeFailed(String),
    #[error("服务器不支持 Range 请求")]
    RangeUnsupported,
    #[error("代理不可达: {0}")]
    ProxyUnreachable(String),
    #[error("分片 {index} 下载失败: {cause}")]
    SegmentFailed { index: usize, cause: FailureCause },
    #[error("数据不完整 (预期 {expected} 字节, 实际 {actual} 字节)")]
    Truncated { expected: u64, actual: u64 },
    #[error("远程文件大小已变化 (记录: {recorded}, 当前: {current})")]
    SizeMismatch { recorded: u64, current: u64 },
    #[error("目标路径不可写 '{path}': {source}")]
    DestinationUnwritable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("任务不存在: {0}")]
    TaskNotFound(String),
    #[error("代理名称已存在: {0}")]
    DuplicateName(String),
    #[error("代理不存在: {0}")]
    ProxyNotFound(String),
    #[error("无效的代理配置: {0}")]
    InvalidProxy(String),
    #[error("无效的任务参数: {0}")]
    InvalidTask(String),
    #[error("任务 {task_id} 当前状态为 {status}，无法执行该操作")]
    InvalidState { task_id: String, status: String },
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    #[error("网络中间件错误: {0}")]
    NetworkMiddleware(#[from] reqwest_middleware::Error),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("临时文件持久化失败: {0}")]
    TempFilePersist(#[from] tempfile::PersistError),
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL 解析错误: {0}")]
    Url(#[from] url::ParseError),
    #[error("用户中断")]
    UserInterrupt,
    #[error("未知错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// 将错误归类为任务失败原因，供持久化记录与事件流使用。
    pub fn failure_cause(&self) -> FailureCause {
        match self {
            AppError::ProbeFailed(_) => FailureCause::ProbeFailed,
            AppError::ProxyUnreachable(_) => FailureCause::ProxyUnreachable,
            AppError::SegmentFailed { cause, .. } => *cause,
            AppError::Truncated { .. } => FailureCause::Truncated,
            AppError::SizeMismatch { .. } => FailureCause::SizeMismatch,
            AppError::DestinationUnwritable { .. } | AppError::Io(_) | AppError::TempFilePersist(_) => {
                FailureCause::DestinationUnwritable
            }
            AppError::Network(err) if err.is_timeout() => FailureCause::Timeout,
            AppError::Network(err) if err.is_connect() => FailureCause::ProxyUnreachable,
            _ => FailureCause::ServerError,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
