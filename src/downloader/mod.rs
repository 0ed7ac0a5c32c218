// src/downloader/mod.rs

mod probe;
mod scheduler;
mod throughput;
mod worker;

use self::scheduler::{ControlCommand, Scheduler};
use crate::{
    config::AppConfig,
    constants,
    error::{AppError, AppResult},
    models::{
        IngestAck, IngestRequest, ProgressEvent, SegmentStatus, SubmitRequest, Task, TaskId,
        TaskStatus,
    },
    proxy::{Liveness, ProxyEndpoint, ProxyRegistry, ProxyTestResult},
    store::PersistenceStore,
};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::{io, sync::Arc};
use tokio::{
    sync::{Semaphore, broadcast, mpsc, watch},
    task::JoinHandle,
};

/// 所有任务共享的进程级状态。
pub(crate) struct EngineShared {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ProxyRegistry>,
    pub store: PersistenceStore,
    pub permits: Arc<Semaphore>,
    pub events: broadcast::Sender<ProgressEvent>,
}

struct TaskEntry {
    snapshot: Arc<watch::Sender<Task>>,
    control: Option<mpsc::Sender<ControlCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl TaskEntry {
    fn idle(task: Task) -> Self {
        Self {
            snapshot: Arc::new(watch::Sender::new(task)),
            control: None,
            handle: None,
        }
    }

    /// 调度器发布最终状态后不再修改任务，此时即视为已停止。
    fn is_running(&self) -> bool {
        !is_settled(self.status()) && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn status(&self) -> TaskStatus {
        self.snapshot.borrow().status
    }
}

/// 调度器仍在处理中的状态。
fn is_settled(status: TaskStatus) -> bool {
    !matches!(
        status,
        TaskStatus::Queued | TaskStatus::Probing | TaskStatus::Downloading
    )
}

async fn wait_settled(mut rx: watch::Receiver<Task>, task_id: &str) -> AppResult<Task> {
    rx.wait_for(|t| is_settled(t.status))
        .await
        .map(|t| t.clone())
        .map_err(|_| AppError::TaskNotFound(task_id.to_string()))
}

async fn remove_partial_file(task: &Task) {
    let partial = task.partial_path();
    match tokio::fs::remove_file(&partial).await {
        Ok(()) => debug!("已删除临时文件 '{}'", partial.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除临时文件 '{}' 失败: {}", partial.display(), e),
    }
}

/// 下载引擎：持有代理注册表、任务表、持久化存储与全局并发上限。
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<EngineShared>,
    tasks: Arc<DashMap<TaskId, TaskEntry>>,
}

impl DownloadManager {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let store = PersistenceStore::new(&config.state_dir)?;
        let registry = Arc::new(ProxyRegistry::new(
            config.proxies.clone(),
            config.config_path.clone(),
        ));
        let (events, _) = broadcast::channel(constants::EVENT_CHANNEL_CAPACITY);
        let permits = Arc::new(Semaphore::new(config.max_active_workers));
        Ok(Self {
            shared: Arc::new(EngineShared {
                config: Arc::new(config),
                registry,
                store,
                permits,
                events,
            }),
            tasks: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.shared.registry
    }

    /// 读取上次运行留下的任务记录。异常退出时仍在运行的任务以暂停状态恢复，等待用户继续。
    pub fn init(&self) -> AppResult<usize> {
        let mut loaded = 0;
        for mut task in self.shared.store.load_all()? {
            if self.tasks.contains_key(&task.id) {
                continue;
            }
            if !is_settled(task.status) {
                for seg in task.segments.iter_mut().filter(|s| !s.is_done()) {
                    seg.status = SegmentStatus::Paused;
                }
                task.set_status(TaskStatus::Paused);
                self.shared.store.save(&task)?;
            }
            debug!(
                "恢复任务 {} ({}), 已下载 {} 字节",
                task.id,
                task.status,
                task.bytes_written()
            );
            self.tasks.insert(task.id.clone(), TaskEntry::idle(task));
            loaded += 1;
        }
        info!("从 '{}' 恢复了 {} 个任务", self.shared.store.state_dir().display(), loaded);
        Ok(loaded)
    }

    fn start(&self, task_id: &str) -> AppResult<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        if entry.is_running() {
            return Ok(());
        }
        let mut task = entry.snapshot.borrow().clone();
        task.set_status(TaskStatus::Queued);
        entry.snapshot.send_replace(task.clone());

        let (tx, rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(task, self.shared.clone(), entry.snapshot.clone(), rx);
        entry.control = Some(tx);
        entry.handle = Some(tokio::spawn(scheduler.run()));
        Ok(())
    }

    pub fn submit(&self, request: SubmitRequest) -> AppResult<TaskId> {
        let config = &self.shared.config;
        let task = Task::new(
            &request.url,
            request.save_dir.unwrap_or_else(|| config.save_dir.clone()),
            request.filename,
            request.thread_count.unwrap_or(config.default_thread_count),
            request.use_proxies,
        )?;
        self.shared.store.save(&task)?;
        let id = task.id.clone();
        info!(
            "新建任务 {}: {} -> {} ({} 线程, 代理: {})",
            id,
            task.url,
            task.filepath().display(),
            task.thread_count,
            task.use_proxies
        );
        self.tasks.insert(id.clone(), TaskEntry::idle(task));
        self.start(&id)?;
        Ok(id)
    }

    /// 外部入口：使用默认线程数与保存目录，并启用代理。
    pub fn ingest(&self, request: IngestRequest) -> IngestAck {
        let submit = SubmitRequest {
            url: request.url,
            filename: request.suggested_filename,
            use_proxies: true,
            ..Default::default()
        };
        match self.submit(submit).and_then(|id| self.task(&id)) {
            Ok(task) => IngestAck::accepted(task.id, task.filename),
            Err(e) => {
                warn!("拒绝外部提交的任务: {}", e);
                IngestAck::rejected(e.to_string())
            }
        }
    }

    fn control_of(&self, task_id: &str) -> AppResult<(TaskStatus, Option<mpsc::Sender<ControlCommand>>, watch::Receiver<Task>)> {
        let entry = self
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        let control = if entry.is_running() {
            entry.control.clone()
        } else {
            None
        };
        Ok((entry.status(), control, entry.snapshot.subscribe()))
    }

    fn invalid_state(task_id: &str, status: TaskStatus) -> AppError {
        AppError::InvalidState {
            task_id: task_id.to_string(),
            status: status.to_string(),
        }
    }

    /// 暂停任务并等待所有工作者确认、进度落盘。
    pub async fn pause(&self, task_id: &str) -> AppResult<Task> {
        let (status, control, rx) = self.control_of(task_id)?;
        match control {
            Some(tx) => {
                if tx.send(ControlCommand::Pause).await.is_err() {
                    debug!("任务 {} 的调度器已退出", task_id);
                }
                wait_settled(rx, task_id).await
            }
            None if status == TaskStatus::Paused => Ok(rx.borrow().clone()),
            None => Err(Self::invalid_state(task_id, status)),
        }
    }

    /// 继续暂停或失败的任务；已在运行的任务不受影响。
    pub fn resume(&self, task_id: &str) -> AppResult<()> {
        let (status, control, _) = self.control_of(task_id)?;
        if control.is_some() {
            return Ok(());
        }
        match status {
            TaskStatus::Paused | TaskStatus::Failed | TaskStatus::Queued => {
                info!("继续任务 {}", task_id);
                self.start(task_id)
            }
            other => Err(Self::invalid_state(task_id, other)),
        }
    }

    /// 取消任务：删除记录和临时文件，不可恢复。
    pub async fn cancel(&self, task_id: &str) -> AppResult<Task> {
        let (status, control, rx) = self.control_of(task_id)?;
        if let Some(tx) = control {
            if tx.send(ControlCommand::Cancel).await.is_err() {
                debug!("任务 {} 的调度器已退出", task_id);
            }
            return wait_settled(rx, task_id).await;
        }
        match status {
            TaskStatus::Paused | TaskStatus::Queued => {
                let entry = self
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
                let snapshot = entry.snapshot.clone();
                drop(entry);

                let task = snapshot.borrow().clone();
                self.shared.store.delete(&task.id)?;
                remove_partial_file(&task).await;
                snapshot.send_modify(|t| t.set_status(TaskStatus::Cancelled));
                info!("任务 {} 已取消", task_id);
                Ok(snapshot.borrow().clone())
            }
            other => Err(Self::invalid_state(task_id, other)),
        }
    }

    /// 从任务列表中移除未在运行的任务，同时删除其记录与临时文件。
    pub async fn remove(&self, task_id: &str) -> AppResult<Task> {
        let (status, control, rx) = self.control_of(task_id)?;
        if control.is_some() {
            return Err(Self::invalid_state(task_id, status));
        }
        let task = rx.borrow().clone();
        self.tasks.remove(task_id);
        self.shared.store.delete(&task.id)?;
        if task.status != TaskStatus::Completed {
            remove_partial_file(&task).await;
        }
        info!("已移除任务 {}", task_id);
        Ok(task)
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn task(&self, task_id: &str) -> AppResult<Task> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.snapshot.borrow().clone())
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))
    }

    /// 等待任务进入稳定状态（完成、失败、暂停或取消）。
    pub async fn wait(&self, task_id: &str) -> AppResult<Task> {
        let (_, _, rx) = self.control_of(task_id)?;
        wait_settled(rx, task_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    pub fn list_proxies(&self) -> Vec<(ProxyEndpoint, Liveness)> {
        self.shared.registry.list()
    }

    pub fn add_proxy(&self, endpoint: ProxyEndpoint) -> AppResult<()> {
        self.shared.registry.add(endpoint)
    }

    pub fn remove_proxy(&self, name: &str) -> AppResult<ProxyEndpoint> {
        self.shared.registry.remove(name)
    }

    pub async fn test_proxy(&self, name: &str) -> AppResult<ProxyTestResult> {
        self.shared.registry.test(&self.shared.config, name).await
    }

    pub async fn test_all_proxies(&self) -> AppResult<Vec<ProxyTestResult>> {
        self.shared.registry.test_all(&self.shared.config).await
    }

    /// 暂停所有运行中的任务并等待调度器退出。
    pub async fn shutdown(&self) {
        let running: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| entry.is_running())
            .map(|entry| entry.key().clone())
            .collect();
        if !running.is_empty() {
            info!("正在暂停 {} 个运行中的任务", running.len());
        }
        for id in &running {
            if let Err(e) = self.pause(id).await {
                warn!("暂停任务 {} 失败: {}", id, e);
            }
        }
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .iter_mut()
            .filter_map(|mut entry| entry.handle.take())
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("调度器异常退出: {}", e);
            }
        }
    }
}
