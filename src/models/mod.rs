// src/models/mod.rs

pub mod events;

use crate::{
    constants,
    error::{AppError, AppResult},
    symbols, utils,
};
use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use url::Url;

pub use events::{IngestAck, IngestRequest, ProgressEvent, SubmitRequest};

/// 任务 ID，跨进程重启保持不变。
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Probing,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 调度器正在运行（探测或下载中）。
    pub fn is_running(self) -> bool {
        matches!(self, TaskStatus::Probing | TaskStatus::Downloading)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn get_display_info(
        &self,
    ) -> (
        &'static ColoredString,
        fn(ColoredString) -> ColoredString,
        &'static str,
    ) {
        match self {
            TaskStatus::Queued => (&symbols::INFO, |s| s.cyan(), "排队中"),
            TaskStatus::Probing => (&symbols::INFO, |s| s.cyan(), "探测中"),
            TaskStatus::Downloading => (&symbols::INFO, |s| s.cyan(), "下载中"),
            TaskStatus::Paused => (&symbols::WARN, |s| s.yellow(), "已暂停"),
            TaskStatus::Completed => (&symbols::OK, |s| s.green(), "已完成"),
            TaskStatus::Failed => (&symbols::ERROR, |s| s.red(), "失败"),
            TaskStatus::Cancelled => (&symbols::WARN, |s| s.yellow(), "已取消"),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_display_info().2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Active,
    Paused,
    Done,
    Failed,
}

/// 分片或任务失败的根本原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    ProbeFailed,
    ProxyUnreachable,
    ServerError,
    Timeout,
    Truncated,
    SizeMismatch,
    DestinationUnwritable,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FailureCause::ProbeFailed => "无法探测资源大小",
            FailureCause::ProxyUnreachable => "代理不可达",
            FailureCause::ServerError => "服务器返回错误",
            FailureCause::Timeout => "网络连接超时",
            FailureCause::Truncated => "数据不完整",
            FailureCause::SizeMismatch => "远程文件大小已变化",
            FailureCause::DestinationUnwritable => "本地文件读写错误",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub cause: FailureCause,
    pub message: String,
}

impl From<&AppError> for TaskFailure {
    fn from(error: &AppError) -> Self {
        Self {
            cause: error.failure_cause(),
            message: error.to_string(),
        }
    }
}

/// 资源中的一段连续字节区间 `[start, end)`。
///
/// `end` 为 `None` 仅出现在长度未知的单流任务中，表示读到响应结束为止。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
    #[serde(default)]
    pub bytes_written: u64,
    /// 分配的代理名称，`None` 表示直连。
    #[serde(default)]
    pub proxy: Option<String>,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            bytes_written: 0,
            proxy: None,
            status: SegmentStatus::Pending,
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// 续传时下一个要请求的绝对偏移。
    pub fn offset(&self) -> u64 {
        self.start + self.bytes_written
    }

    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.bytes_written))
    }

    pub fn is_done(&self) -> bool {
        self.status == SegmentStatus::Done
    }

    /// 生成 Range 请求头，`end` 为不含上界。
    pub fn range_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.offset(), end.saturating_sub(1)),
            None => format!("bytes={}-", self.offset()),
        }
    }

    /// 累加已落盘字节数，永不超过区间长度。
    pub fn record_written(&mut self, delta: u64) {
        self.bytes_written = match self.len() {
            Some(len) => (self.bytes_written + delta).min(len),
            None => self.bytes_written + delta,
        };
    }

    pub fn reset(&mut self) {
        self.bytes_written = 0;
        self.status = SegmentStatus::Pending;
    }
}

/// 将 `[0, total)` 按 `⌈total/n⌉` 切分；末段吸收余数，永不产生空分片。
pub fn partition(total: u64, desired: usize) -> Vec<Segment> {
    if total == 0 {
        let mut seg = Segment::new(0, 0, Some(0));
        seg.status = SegmentStatus::Done;
        return vec![seg];
    }
    let count = (desired.max(1) as u64).min(total);
    let size = total.div_ceil(count);
    let mut segments = Vec::with_capacity(count as usize);
    let mut start = 0;
    while start < total {
        let end = (start + size).min(total);
        segments.push(Segment::new(segments.len(), start, Some(end)));
        start = end;
    }
    segments
}

fn current_record_version() -> u32 {
    constants::RECORD_VERSION
}

fn default_true() -> bool {
    true
}

/// 一个端到端的下载任务。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "current_record_version")]
    pub record_version: u32,
    pub id: TaskId,
    pub url: String,
    pub save_dir: PathBuf,
    pub filename: String,
    /// 用户显式指定了文件名，探测时不再使用 `Content-Disposition` 覆盖。
    #[serde(default)]
    pub explicit_filename: bool,
    /// 探测前未知；一旦确定不可再变。
    #[serde(default)]
    pub total_size: Option<u64>,
    pub thread_count: usize,
    #[serde(default = "default_true")]
    pub use_proxies: bool,
    #[serde(default)]
    pub ranges_supported: bool,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub status: TaskStatus,
    #[serde(default)]
    pub failure: Option<TaskFailure>,
    /// 累计活跃下载时长（秒），用于计算平均速度。
    #[serde(default)]
    pub active_secs: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        url: &str,
        save_dir: PathBuf,
        filename: Option<String>,
        thread_count: usize,
        use_proxies: bool,
    ) -> AppResult<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::InvalidTask("下载链接不能为空".to_string()));
        }
        if save_dir.as_os_str().is_empty() {
            return Err(AppError::InvalidTask("保存目录不能为空".to_string()));
        }
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::InvalidTask(format!(
                "不支持的协议: {}",
                parsed.scheme()
            )));
        }

        let explicit = filename
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .map(|f| utils::sanitize_filename(&f));
        let explicit_filename = explicit.is_some();
        let filename = explicit.unwrap_or_else(|| utils::filename_from_url(&parsed));

        let now = Utc::now();
        Ok(Self {
            record_version: constants::RECORD_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            save_dir,
            filename,
            explicit_filename,
            total_size: None,
            thread_count: thread_count.clamp(1, constants::MAX_THREADS_PER_TASK),
            use_proxies,
            ranges_supported: false,
            segments: Vec::new(),
            status: TaskStatus::Queued,
            failure: None,
            active_secs: 0.0,
            created_at: now,
            updated_at: now,
        })
    }

    /// 下载完成后的最终文件路径。
    pub fn filepath(&self) -> PathBuf {
        self.save_dir.join(&self.filename)
    }

    /// 下载过程中写入的预分配文件。
    pub fn partial_path(&self) -> PathBuf {
        self.save_dir
            .join(format!("{}{}", self.filename, constants::PARTIAL_SUFFIX))
    }

    pub fn has_plan(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn bytes_written(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.has_plan() && self.segments.iter().all(Segment::is_done)
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if status != TaskStatus::Failed {
            self.failure = None;
        }
        self.touch();
    }

    pub fn fail(&mut self, failure: TaskFailure) {
        self.status = TaskStatus::Failed;
        self.failure = Some(failure);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 根据探测结果生成分片计划。大小未知或不支持 Range 时退化为单流。
    pub fn apply_plan(&mut self, total_size: Option<u64>, ranges_supported: bool) {
        self.total_size = total_size;
        self.ranges_supported = ranges_supported && total_size.is_some();
        self.segments = match total_size {
            Some(total) if self.ranges_supported => partition(total, self.thread_count),
            Some(total) => partition(total, 1),
            None => vec![Segment::new(0, 0, None)],
        };
        self.touch();
    }

    /// 退化为单个覆盖全部资源的分片，已写入的字节全部作废。
    pub fn collapse_to_single_stream(&mut self) {
        self.ranges_supported = false;
        self.segments = match self.total_size {
            Some(total) => partition(total, 1),
            None => vec![Segment::new(0, 0, None)],
        };
        self.touch();
    }

    /// 校验分片是否恰好覆盖 `[0, total)`，无空洞、无重叠。
    pub fn check_partition(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(AppError::InvalidTask(format!("任务 {}: {}", self.id, msg)));
        if self.segments.is_empty() {
            return Ok(());
        }
        let Some(total) = self.total_size else {
            return match self.segments.as_slice() {
                [only] if only.start == 0 && only.end.is_none() => Ok(()),
                _ => invalid("大小未知的任务只能有一个分片".to_string()),
            };
        };

        let mut cursor = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            let Some(end) = seg.end else {
                return invalid(format!("分片 {} 缺少结束位置", i));
            };
            if seg.index != i || seg.start != cursor || end < seg.start {
                return invalid(format!("分片 {} 的区间不连续", i));
            }
            if seg.bytes_written > end - seg.start {
                return invalid(format!("分片 {} 记录的已写入字节超过区间长度", i));
            }
            cursor = end;
        }
        if cursor != total {
            return invalid(format!("分片总长 {} 与文件大小 {} 不符", cursor, total));
        }
        Ok(())
    }
}
