// src/store.rs

use crate::{
    error::AppResult,
    models::{SegmentStatus, Task, TaskId, TaskStatus},
};
use anyhow::Context;
use log::{debug, warn};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// 任务记录的持久化存储，每个任务一个 JSON 文件。
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    state_dir: PathBuf,
}

impl PersistenceStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("无法创建任务状态目录 '{}'", state_dir.display()))?;
        Ok(Self { state_dir })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn record_path(&self, task_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", task_id))
    }

    /// 先写入同目录下的临时文件再原子替换，崩溃时旧记录保持完整。
    pub fn save(&self, task: &Task) -> AppResult<()> {
        let mut tmp = NamedTempFile::new_in(&self.state_dir)?;
        serde_json::to_writer_pretty(&mut tmp, task)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(&task.id))?;
        debug!(
            "已保存任务记录 {} ({:?}, {} 字节)",
            task.id,
            task.status,
            task.bytes_written()
        );
        Ok(())
    }

    pub fn delete(&self, task_id: &str) -> AppResult<()> {
        match fs::remove_file(self.record_path(task_id)) {
            Ok(()) => {
                debug!("已删除任务记录 {}", task_id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(&self, task_id: &TaskId) -> AppResult<Option<Task>> {
        let path = self.record_path(task_id);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(read_record(&path))
    }

    /// 惰性遍历所有未完成的任务记录。每次调用都会重新扫描目录。
    pub fn load_all(&self) -> AppResult<Records> {
        Ok(Records {
            entries: fs::read_dir(&self.state_dir)?,
        })
    }
}

pub struct Records {
    entries: fs::ReadDir,
}

impl Iterator for Records {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        for entry in self.entries.by_ref() {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("读取任务状态目录失败: {}", e);
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(task) = read_record(&path) {
                if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
                    continue;
                }
                return Some(task);
            }
        }
        None
    }
}

/// 读取并校验单条记录，损坏的记录返回 `None`。
fn read_record(path: &Path) -> Option<Task> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("无法读取任务记录 '{}': {}", path.display(), e);
            return None;
        }
    };
    let mut task: Task = match serde_json::from_str(&content) {
        Ok(t) => t,
        Err(e) => {
            warn!("跳过无法解析的任务记录 '{}': {}", path.display(), e);
            return None;
        }
    };
    if let Err(e) = task.check_partition() {
        warn!("跳过分片信息无效的任务记录 '{}': {}", path.display(), e);
        return None;
    }
    reconcile(&mut task);
    Some(task)
}

/// 以磁盘上临时文件的实际长度为准修正记录中的进度。
pub fn reconcile(task: &mut Task) {
    if !task.has_plan() || task.status == TaskStatus::Completed {
        return;
    }

    // 上次异常退出时仍在运行的分片
    for seg in task.segments.iter_mut() {
        if matches!(seg.status, SegmentStatus::Active | SegmentStatus::Paused) {
            seg.status = SegmentStatus::Pending;
        }
    }

    // 不支持 Range 的任务只能从头开始
    if !task.ranges_supported {
        if task.bytes_written() > 0 {
            debug!("任务 {} 不支持断点续传，进度清零", task.id);
        }
        for seg in task.segments.iter_mut().filter(|s| s.len() != Some(0)) {
            seg.reset();
        }
        return;
    }

    let partial_len = fs::metadata(task.partial_path()).ok().map(|m| m.len());
    match partial_len {
        None => {
            if task.bytes_written() > 0 {
                warn!(
                    "任务 {} 的临时文件 '{}' 不存在，将从头下载",
                    task.id,
                    task.partial_path().display()
                );
            }
            for seg in task.segments.iter_mut().filter(|s| s.len() != Some(0)) {
                seg.reset();
            }
        }
        Some(file_len) => {
            for seg in task.segments.iter_mut() {
                if seg.offset() > file_len {
                    let kept = file_len.saturating_sub(seg.start);
                    warn!(
                        "任务 {} 分片 {} 记录的进度超出文件长度，回退到 {} 字节",
                        task.id, seg.index, kept
                    );
                    seg.bytes_written = kept;
                    seg.status = SegmentStatus::Pending;
                }
            }
        }
    }

    for seg in task.segments.iter_mut() {
        let full = seg.len().is_some_and(|len| seg.bytes_written == len);
        if seg.status == SegmentStatus::Done && !full {
            seg.status = SegmentStatus::Pending;
        } else if full && seg.status != SegmentStatus::Done {
            seg.status = SegmentStatus::Done;
        }
    }
}
