// src/models/events.rs

use super::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 进度事件，按固定间隔以及每次状态变化时广播。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub filename: String,
    pub bytes_written: u64,
    pub total_size: Option<u64>,
    pub status: TaskStatus,
    /// 字节/秒
    pub throughput: f64,
}

impl ProgressEvent {
    pub fn percent(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_written as f64 * 100.0 / total as f64),
            None => None,
        }
    }
}

/// 提交下载任务的参数，未指定的字段使用配置中的默认值。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub url: String,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub thread_count: Option<usize>,
    #[serde(default = "default_use_proxies")]
    pub use_proxies: bool,
}

fn default_use_proxies() -> bool {
    true
}

impl SubmitRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            use_proxies: true,
            ..Default::default()
        }
    }
}

/// 浏览器扩展等外部入口提交的请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub url: String,
    #[serde(default, alias = "filename")]
    pub suggested_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
    pub message: String,
    pub task_id: Option<TaskId>,
    pub filename: Option<String>,
}

impl IngestAck {
    pub fn accepted(task_id: TaskId, filename: String) -> Self {
        Self {
            status: "success".to_string(),
            message: "下载任务已添加".to_string(),
            task_id: Some(task_id),
            filename: Some(filename),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            task_id: None,
            filename: None,
        }
    }
}
