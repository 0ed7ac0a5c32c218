// src/downloader/scheduler.rs

use super::{
    EngineShared,
    probe::{self, ProbeOutcome},
    throughput::ThroughputMeter,
    worker::{SegmentWorker, WorkerMsg},
};
use crate::{
    client::{Transport, build_transport},
    constants,
    error::{AppError, AppResult},
    models::{FailureCause, ProgressEvent, SegmentStatus, Task, TaskFailure, TaskStatus},
    proxy::{Liveness, ProxyEndpoint, ProxyFailureKind},
    store,
};
use log::{debug, error, info, warn};
use std::{
    collections::{HashMap, VecDeque},
    io,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    fs::OpenOptions,
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// 发给正在运行的调度器的控制命令。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    Pause,
    Cancel,
}

enum Exit {
    Completed,
    Paused,
    Cancelled,
}

enum Flow {
    Continue,
    Collapse,
}

fn destination_error(path: &Path, source: io::Error) -> AppError {
    AppError::DestinationUnwritable {
        path: path.display().to_string(),
        source,
    }
}

/// 单个任务的调度器：探测、分片、分配代理、监控工作者并在结束时收尾。
/// 任务状态只由它一个写入者修改。
pub(crate) struct Scheduler {
    task: Task,
    shared: Arc<EngineShared>,
    snapshot: Arc<watch::Sender<Task>>,
    control: mpsc::Receiver<ControlCommand>,
    transports: HashMap<String, (ProxyEndpoint, Arc<dyn Transport>)>,
    direct: Option<Arc<dyn Transport>>,
    meter: ThroughputMeter,
    attempts: HashMap<usize, u32>,
    rr_cursor: usize,
    active_since: Option<Instant>,
}

impl Scheduler {
    pub(crate) fn new(
        task: Task,
        shared: Arc<EngineShared>,
        snapshot: Arc<watch::Sender<Task>>,
        control: mpsc::Receiver<ControlCommand>,
    ) -> Self {
        Self {
            task,
            shared,
            snapshot,
            control,
            transports: HashMap::new(),
            direct: None,
            meter: ThroughputMeter::new(Duration::from_secs_f64(constants::THROUGHPUT_WINDOW_SECS)),
            attempts: HashMap::new(),
            rr_cursor: 0,
            active_since: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let id = self.task.id.clone();
        match self.drive().await {
            Ok(Exit::Completed) => info!("任务 {} 下载完成: {}", id, self.task.filepath().display()),
            Ok(Exit::Paused) => info!("任务 {} 已暂停，已下载 {} 字节", id, self.task.bytes_written()),
            Ok(Exit::Cancelled) => info!("任务 {} 已取消", id),
            Err(e) => {
                error!("任务 {} 失败: {}", id, e);
                self.stop_clock();
                self.task.fail(TaskFailure::from(&e));
                if let Err(save_err) = self.checkpoint() {
                    // 记录写不进去也要让等待者看到最终状态
                    warn!("任务 {} 保存失败状态时出错: {}", id, save_err);
                    self.publish();
                }
            }
        }
    }

    async fn drive(&mut self) -> AppResult<Exit> {
        let fresh = !self.task.has_plan();
        self.task.set_status(TaskStatus::Probing);
        self.checkpoint()?;

        let transports = self.probe_transports()?;
        let url = self.task.url.clone();
        let timeout = self.shared.config.probe_timeout;
        let outcome = tokio::select! {
            res = probe::probe(&url, &transports, timeout) => res?,
            cmd = self.control.recv() => {
                return self.finish_with(cmd.unwrap_or(ControlCommand::Pause)).await;
            }
        };

        self.apply_probe(outcome)?;
        if fresh && self.existing_file_matches().await {
            info!("文件 '{}' 已存在，跳过下载", self.task.filepath().display());
            self.task.set_status(TaskStatus::Completed);
            self.forget_record();
            self.publish();
            return Ok(Exit::Completed);
        }
        if !fresh {
            // 暂停期间临时文件可能被删除或截断
            let before = self.task.bytes_written();
            store::reconcile(&mut self.task);
            let after = self.task.bytes_written();
            if after != before {
                warn!(
                    "任务 {} 的临时文件与记录不符，进度从 {} 修正为 {} 字节",
                    self.task.id, before, after
                );
            }
        }

        self.prepare_file().await?;
        self.download().await
    }

    /// 目标文件已存在，且远程大小未知或与其一致。
    async fn existing_file_matches(&self) -> bool {
        let target = self.task.filepath();
        let Ok(meta) = tokio::fs::metadata(&target).await else {
            return false;
        };
        if self.task.total_size.is_none_or(|total| total == meta.len()) {
            return true;
        }
        warn!(
            "已存在的文件 '{}' 大小为 {} 字节，与远程 {:?} 不符，将重新下载",
            target.display(),
            meta.len(),
            self.task.total_size
        );
        false
    }

    /// 删除任务记录；失败只记日志，不影响已经确定的结果。
    fn forget_record(&self) {
        if let Err(e) = self.shared.store.delete(&self.task.id) {
            warn!("删除任务 {} 的记录失败: {}", self.task.id, e);
        }
    }

    /// 探测顺序：可用代理依次尝试，最后直连。
    fn probe_transports(&mut self) -> AppResult<Vec<Arc<dyn Transport>>> {
        let mut list = Vec::new();
        if self.task.use_proxies {
            for endpoint in self.shared.registry.available() {
                list.push(self.transport_for(Some(&endpoint))?);
            }
        }
        list.push(self.transport_for(None)?);
        Ok(list)
    }

    fn apply_probe(&mut self, outcome: ProbeOutcome) -> AppResult<()> {
        if !self.task.has_plan() {
            if !self.task.explicit_filename
                && let Some(name) = outcome.filename
            {
                debug!("使用服务器提供的文件名: {}", name);
                self.task.filename = name;
            }
            self.task.apply_plan(outcome.total_size, outcome.ranges_supported);
            info!(
                "任务 {} 分为 {} 个分片 (大小: {:?})",
                self.task.id,
                self.task.segments.len(),
                self.task.total_size
            );
            return Ok(());
        }

        if let (Some(recorded), Some(current)) = (self.task.total_size, outcome.total_size)
            && recorded != current
        {
            return Err(AppError::SizeMismatch { recorded, current });
        }
        if self.task.ranges_supported && !outcome.ranges_supported {
            warn!("任务 {} 的服务器不再支持 Range 请求，改为单线程重新下载", self.task.id);
            self.task.collapse_to_single_stream();
        }
        Ok(())
    }

    /// 在任何工作者启动前一次性创建并预分配临时文件。
    async fn prepare_file(&mut self) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.task.save_dir)
            .await
            .map_err(|e| destination_error(&self.task.save_dir, e))?;
        let path = self.task.partial_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| destination_error(&path, e))?;
        let current_len = file.metadata().await?.len();

        if !self.task.ranges_supported {
            for seg in self.task.segments.iter_mut().filter(|s| s.len() != Some(0)) {
                seg.reset();
            }
            file.set_len(0).await?;
        }
        match self.task.total_size {
            Some(total) if !self.task.ranges_supported || current_len != total => {
                debug!("预分配文件 '{}' 为 {} 字节", path.display(), total);
                file.set_len(total).await.map_err(|e| destination_error(&path, e))?;
            }
            _ => {}
        }
        file.sync_all().await?;
        Ok(())
    }

    async fn download(&mut self) -> AppResult<Exit> {
        self.task.set_status(TaskStatus::Downloading);
        self.active_since = Some(Instant::now());
        self.meter.reset();
        self.checkpoint()?;

        let (tx, mut rx) = mpsc::channel::<WorkerMsg>(256);
        let mut cancel = CancellationToken::new();
        let mut queue: VecDeque<usize> = self
            .task
            .segments
            .iter()
            .filter(|s| !s.is_done())
            .map(|s| s.index)
            .collect();
        let mut active = 0usize;
        let mut dirty = false;
        let mut last_checkpoint = Instant::now();
        let mut tick = tokio::time::interval(
            self.shared.config.progress_interval.max(Duration::from_millis(10)),
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end: AppResult<Option<ControlCommand>> = loop {
            if let Err(e) = self.launch(&mut queue, &mut active, &tx, &cancel) {
                break Err(e);
            }
            if active == 0 && queue.is_empty() {
                break Ok(None);
            }

            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break Ok(Some(ControlCommand::Pause)) };
                    match self.on_message(msg, &mut queue, &mut active, &mut dirty) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Collapse) => {
                            self.stop_workers(&cancel, &mut rx, &mut active).await;
                            cancel = CancellationToken::new();
                            if let Err(e) = self.collapse().await {
                                break Err(e);
                            }
                            queue = VecDeque::from([0]);
                        }
                        Err(e) => break Err(e),
                    }
                }
                cmd = self.control.recv() => break Ok(Some(cmd.unwrap_or(ControlCommand::Pause))),
                _ = tick.tick() => {
                    self.publish();
                    if dirty && last_checkpoint.elapsed() >= self.shared.config.checkpoint_interval {
                        if let Err(e) = self.checkpoint() {
                            break Err(e);
                        }
                        dirty = false;
                        last_checkpoint = Instant::now();
                    }
                }
            }
        };

        self.stop_workers(&cancel, &mut rx, &mut active).await;
        match end? {
            None => self.finalize().await,
            Some(cmd) => self.finish_with(cmd).await,
        }
    }

    /// 按线程数上限启动排队中的分片。
    fn launch(
        &mut self,
        queue: &mut VecDeque<usize>,
        active: &mut usize,
        tx: &mpsc::Sender<WorkerMsg>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        while *active < self.task.thread_count {
            let Some(index) = queue.pop_front() else { break };
            let transport = self.assign()?;
            let segment = {
                let seg = &mut self.task.segments[index];
                seg.proxy = transport.proxy_name().map(String::from);
                seg.status = SegmentStatus::Active;
                seg.clone()
            };
            debug!(
                "任务 {} 分片 {} 分配到{}",
                self.task.id,
                index,
                transport.label()
            );

            let worker = SegmentWorker {
                task_id: self.task.id.clone(),
                url: self.task.url.clone(),
                segment,
                total_size: self.task.total_size,
                path: self.task.partial_path(),
                transport,
                checkpoint_bytes: self.shared.config.checkpoint_bytes,
                permits: self.shared.permits.clone(),
                cancel: cancel.child_token(),
                tx: tx.clone(),
            };
            tokio::spawn(worker.run());
            *active += 1;
        }
        Ok(())
    }

    /// 在当前可用的代理间轮询；没有代理或禁用代理时直连。
    fn assign(&mut self) -> AppResult<Arc<dyn Transport>> {
        if self.task.use_proxies {
            let available = self.shared.registry.available();
            if !available.is_empty() {
                let endpoint = available[self.rr_cursor % available.len()].clone();
                self.rr_cursor += 1;
                return self.transport_for(Some(&endpoint));
            }
        }
        self.transport_for(None)
    }

    fn transport_for(&mut self, endpoint: Option<&ProxyEndpoint>) -> AppResult<Arc<dyn Transport>> {
        let config = &self.shared.config;
        match endpoint {
            Some(ep) => {
                if let Some((cached_ep, transport)) = self.transports.get(&ep.name)
                    && cached_ep == ep
                {
                    return Ok(transport.clone());
                }
                let transport = build_transport(config, Some(ep))?;
                self.transports
                    .insert(ep.name.clone(), (ep.clone(), transport.clone()));
                Ok(transport)
            }
            None => {
                if let Some(transport) = &self.direct {
                    return Ok(transport.clone());
                }
                let transport = build_transport(config, None)?;
                self.direct = Some(transport.clone());
                Ok(transport)
            }
        }
    }

    /// 只更新计数，不做任何调度决策。
    fn absorb(&mut self, msg: &WorkerMsg) {
        match *msg {
            WorkerMsg::Progress { index, delta } => {
                self.task.segments[index].record_written(delta);
                self.meter.record(self.task.bytes_written());
            }
            WorkerMsg::Rewound { index } => {
                self.task.segments[index].reset();
                self.task.segments[index].status = SegmentStatus::Active;
                self.meter.reset();
            }
            WorkerMsg::Done { index } => {
                let seg = &mut self.task.segments[index];
                if seg.end.is_none() {
                    // 长度未知的单流下载，在结束时确定总大小
                    seg.end = Some(seg.start + seg.bytes_written);
                    self.task.total_size = seg.end;
                }
                seg.status = SegmentStatus::Done;
            }
            WorkerMsg::Stopped { index } | WorkerMsg::RangeUnsupported { index } => {
                let seg = &mut self.task.segments[index];
                if !seg.is_done() {
                    seg.status = SegmentStatus::Paused;
                }
            }
            WorkerMsg::Failed { index, .. } => {
                self.task.segments[index].status = SegmentStatus::Failed;
            }
        }
    }

    fn on_message(
        &mut self,
        msg: WorkerMsg,
        queue: &mut VecDeque<usize>,
        active: &mut usize,
        dirty: &mut bool,
    ) -> AppResult<Flow> {
        self.absorb(&msg);
        match msg {
            WorkerMsg::Progress { .. } | WorkerMsg::Rewound { .. } => {
                *dirty = true;
                Ok(Flow::Continue)
            }
            WorkerMsg::Done { index } => {
                *active -= 1;
                debug!("任务 {} 分片 {} 完成", self.task.id, index);
                self.checkpoint()?;
                *dirty = false;
                Ok(Flow::Continue)
            }
            WorkerMsg::Stopped { index } => {
                // 非暂停状态下意外停止，重新排队
                *active -= 1;
                self.task.segments[index].status = SegmentStatus::Pending;
                queue.push_back(index);
                Ok(Flow::Continue)
            }
            WorkerMsg::RangeUnsupported { index } => {
                *active -= 1;
                if self.task.ranges_supported {
                    warn!(
                        "任务 {} 分片 {} 发现服务器忽略 Range，改为单线程下载",
                        self.task.id, index
                    );
                    Ok(Flow::Collapse)
                } else {
                    Err(AppError::RangeUnsupported)
                }
            }
            WorkerMsg::Failed { index, error } => {
                *active -= 1;
                self.on_segment_failure(index, error, queue)?;
                self.checkpoint()?;
                Ok(Flow::Continue)
            }
        }
    }

    /// 分片失败：换下一个通道重试，超过次数后整个任务失败。
    fn on_segment_failure(
        &mut self,
        index: usize,
        error: AppError,
        queue: &mut VecDeque<usize>,
    ) -> AppResult<()> {
        let cause = error.failure_cause();
        let proxy = self.task.segments[index].proxy.clone();
        warn!(
            "任务 {} 分片 {} 通过 {} 下载失败: {}",
            self.task.id,
            index,
            proxy.as_deref().unwrap_or("直连"),
            error
        );

        if cause == FailureCause::DestinationUnwritable {
            return Err(error);
        }
        if cause == FailureCause::ProxyUnreachable
            && let Some(name) = &proxy
        {
            let kind = match &error {
                AppError::Network(e) if e.is_timeout() => ProxyFailureKind::ConnectTimeout,
                _ => ProxyFailureKind::RefusedConnection,
            };
            self.shared.registry.mark(name, Liveness::Unreachable { kind });
            self.transports.remove(name);
        }

        let attempts = self.attempts.entry(index).or_insert(0);
        *attempts += 1;
        let limit = self
            .shared
            .config
            .max_reassignments
            .max(self.shared.registry.len() as u32);
        if *attempts > limit {
            return Err(AppError::SegmentFailed { index, cause });
        }

        info!(
            "任务 {} 分片 {} 重新分配 (第 {}/{} 次)",
            self.task.id, index, attempts, limit
        );
        self.task.segments[index].status = SegmentStatus::Pending;
        queue.push_back(index);
        Ok(())
    }

    /// 通知所有工作者停止，并等待它们把已写入的数据报告回来。
    async fn stop_workers(
        &mut self,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<WorkerMsg>,
        active: &mut usize,
    ) {
        cancel.cancel();
        while *active > 0 {
            let Some(msg) = rx.recv().await else { break };
            if !matches!(msg, WorkerMsg::Progress { .. } | WorkerMsg::Rewound { .. }) {
                *active -= 1;
            }
            self.absorb(&msg);
        }
    }

    /// 退化为单流并截断临时文件。
    async fn collapse(&mut self) -> AppResult<()> {
        self.task.collapse_to_single_stream();
        self.attempts.clear();
        self.meter.reset();
        let path = self.task.partial_path();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| destination_error(&path, e))?;
        file.set_len(0).await?;
        if let Some(total) = self.task.total_size {
            file.set_len(total).await?;
        }
        file.sync_all().await?;
        self.checkpoint()
    }

    async fn finalize(&mut self) -> AppResult<Exit> {
        self.stop_clock();
        let partial = self.task.partial_path();
        let actual = tokio::fs::metadata(&partial).await?.len();
        if let Some(expected) = self.task.total_size
            && actual != expected
        {
            return Err(AppError::Truncated { expected, actual });
        }
        let target = self.task.filepath();
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| destination_error(&target, e))?;

        self.task.set_status(TaskStatus::Completed);
        self.forget_record();
        self.publish();
        Ok(Exit::Completed)
    }

    async fn finish_with(&mut self, cmd: ControlCommand) -> AppResult<Exit> {
        self.stop_clock();
        match cmd {
            ControlCommand::Pause => {
                for seg in self.task.segments.iter_mut().filter(|s| !s.is_done()) {
                    seg.status = SegmentStatus::Paused;
                }
                self.task.set_status(TaskStatus::Paused);
                self.checkpoint()?;
                Ok(Exit::Paused)
            }
            ControlCommand::Cancel => {
                self.forget_record();
                let partial = self.task.partial_path();
                match tokio::fs::remove_file(&partial).await {
                    Ok(()) => debug!("已删除临时文件 '{}'", partial.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("删除临时文件 '{}' 失败: {}", partial.display(), e),
                }
                self.task.set_status(TaskStatus::Cancelled);
                self.publish();
                Ok(Exit::Cancelled)
            }
        }
    }

    fn active_secs(&self) -> f64 {
        self.task.active_secs
            + self
                .active_since
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0)
    }

    fn stop_clock(&mut self) {
        self.task.active_secs = self.active_secs();
        self.active_since = None;
    }

    /// 持久化当前状态并广播一次进度。
    fn checkpoint(&mut self) -> AppResult<()> {
        if self.active_since.is_some() {
            self.task.active_secs = self.active_secs();
            self.active_since = Some(Instant::now());
        }
        self.task.touch();
        self.shared.store.save(&self.task)?;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let bytes_written = self.task.bytes_written();
        let event = ProgressEvent {
            task_id: self.task.id.clone(),
            filename: self.task.filename.clone(),
            bytes_written,
            total_size: self.task.total_size,
            status: self.task.status,
            throughput: self.meter.estimate(bytes_written, self.active_secs()),
        };
        // 没有订阅者时发送失败是正常的
        let _ = self.shared.events.send(event);
        self.snapshot.send_replace(self.task.clone());
    }
}
