// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod store;
pub mod symbols;
pub mod ui;
pub mod utils;

use crate::{
    cli::Cli,
    config::AppConfig,
    downloader::DownloadManager,
    error::{AppError, AppResult},
    models::{SubmitRequest, TaskId, TaskStatus},
    proxy::ProxyEndpoint,
};
use anyhow::anyhow;
use colored::*;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info, warn};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;

/// 库的公共入口点，由 `main.rs` 调用
pub async fn run_from_cli(args: Arc<Cli>) -> AppResult<()> {
    logging::init_logger(args.log_level);
    debug!("CLI 参数: {:?}", args);

    let config = AppConfig::new(&args)?;
    debug!("加载的应用配置: {:?}", config);
    let manager = DownloadManager::new(config)?;

    if args.proxies {
        ui::print_proxy_table(&manager.list_proxies());
        return Ok(());
    }
    if let Some(spec) = &args.add_proxy {
        let (name, host, port) = utils::parse_proxy_spec(spec)?;
        let endpoint = ProxyEndpoint::new(&name, &host, port)?;
        manager.add_proxy(endpoint.clone())?;
        println!("\n{} 已添加代理 {}", *symbols::OK, endpoint);
        return Ok(());
    }
    if let Some(name) = &args.remove_proxy {
        let endpoint = manager.remove_proxy(name)?;
        println!("\n{} 已删除代理 {}", *symbols::OK, endpoint);
        return Ok(());
    }
    if args.test_proxies {
        return handle_test_proxies(&manager).await;
    }

    manager.init()?;
    if args.list {
        ui::print_task_table(&manager.list_tasks());
    } else if let Some(id) = &args.cancel {
        let task = manager.cancel(id).await?;
        ui::print_task_result(&task);
    } else if let Some(id) = &args.remove {
        let task = manager.remove(id).await?;
        println!("\n{} 已移除任务 {} ({})", *symbols::OK, task.id, task.filename);
    } else if let Some(target) = args.resume_target() {
        handle_resume(&manager, target).await?;
    } else if let Some(url) = &args.url {
        let save_dir = &manager.config().save_dir;
        std::fs::create_dir_all(save_dir)?;
        let absolute_path = dunce::canonicalize(save_dir)?;
        info!("文件将保存到目录: \"{}\"", absolute_path.display());
        println!(
            "\n{} 文件将保存到目录: \"{}\"",
            *symbols::INFO,
            absolute_path.display()
        );

        let request = SubmitRequest {
            url: url.clone(),
            save_dir: Some(absolute_path),
            filename: args.filename.clone(),
            use_proxies: !args.no_proxy,
            ..Default::default()
        };
        let mut watcher = TaskWatcher::new(&manager);
        let id = manager.submit(request)?;
        ui::print_header("开始下载");
        println!("{} 任务 {}: {}", *symbols::INFO, id, url);
        watcher.watch(vec![id]).await?;
    }
    Ok(())
}

async fn handle_test_proxies(manager: &DownloadManager) -> AppResult<()> {
    if manager.registry().is_empty() {
        println!("\n{} 尚未配置任何代理。", *symbols::INFO);
        return Ok(());
    }
    println!(
        "\n{} 正在通过 {} 个代理连接 {} ...",
        *symbols::INFO,
        manager.registry().len(),
        manager.config().proxy_probe_target
    );
    let results = manager.test_all_proxies().await?;
    ui::print_proxy_test_results(&results);
    Ok(())
}

async fn handle_resume(manager: &DownloadManager, target: Option<&str>) -> AppResult<()> {
    let ids: Vec<TaskId> = match target {
        Some(id) => vec![manager.task(id)?.id],
        None => manager
            .list_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Paused | TaskStatus::Failed))
            .map(|t| t.id)
            .collect(),
    };
    if ids.is_empty() {
        println!("\n{} 没有可以继续的任务。", *symbols::INFO);
        return Ok(());
    }

    let mut watcher = TaskWatcher::new(manager);
    for id in &ids {
        manager.resume(id)?;
    }
    ui::print_header(&format!("继续 {} 个任务", ids.len()));
    watcher.watch(ids).await
}

/// 在终端上跟踪一组任务直到它们结束，Ctrl+C 时暂停全部任务。
struct TaskWatcher<'a> {
    manager: &'a DownloadManager,
    events: tokio::sync::broadcast::Receiver<models::ProgressEvent>,
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl<'a> TaskWatcher<'a> {
    /// 在提交任务之前创建，以免漏掉最早的进度事件。
    fn new(manager: &'a DownloadManager) -> Self {
        Self {
            manager,
            events: manager.subscribe(),
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn on_event(&mut self, event: models::ProgressEvent) {
        if !self.bars.contains_key(&event.task_id) {
            if event.status != TaskStatus::Downloading {
                return;
            }
            let prefix = utils::truncate_text(&event.filename, 24);
            let pbar = self
                .multi
                .add(ui::new_bytes_progress_bar(event.total_size, &prefix));
            pbar.enable_steady_tick(Duration::from_millis(100));
            self.bars.insert(event.task_id.clone(), pbar);
        }
        if let Some(pbar) = self.bars.get(&event.task_id) {
            ui::update_progress_bar(pbar, &event);
        }
    }

    fn clear(&mut self) {
        for (_, pbar) in self.bars.drain() {
            pbar.finish_and_clear();
        }
    }

    async fn watch(&mut self, ids: Vec<TaskId>) -> AppResult<()> {
        let manager = self.manager;
        println!("{} 按 {} 可暂停下载并保存进度。", *symbols::INFO, *symbols::CTRL_C);
        let waits = futures::future::join_all(ids.iter().map(|id| manager.wait(id)));
        tokio::pin!(waits);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let results = loop {
            tokio::select! {
                results = &mut waits => break results,
                event = self.events.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(RecvError::Lagged(n)) => debug!("进度事件积压，跳过 {} 条", n),
                    Err(RecvError::Closed) => {}
                },
                _ = &mut ctrl_c => {
                    self.clear();
                    println!("\n{} 正在暂停任务并保存进度...", *symbols::WARN);
                    info!("收到中断信号，暂停所有任务");
                    manager.shutdown().await;
                    return Err(AppError::UserInterrupt);
                }
            }
        };
        self.clear();

        ui::print_sub_header("下载结果");
        let mut failed = 0;
        for result in results {
            match result {
                Ok(task) => {
                    if task.status == TaskStatus::Failed {
                        failed += 1;
                    }
                    ui::print_task_result(&task);
                }
                Err(e) => {
                    warn!("等待任务时出错: {}", e);
                    failed += 1;
                    eprintln!("{} {}", *symbols::ERROR, e);
                }
            }
        }
        if failed > 0 {
            println!("\n{}", "可使用 --resume 继续失败的任务，或 --list 查看详情。".yellow());
            return Err(AppError::Other(anyhow!("{} 个任务下载失败", failed)));
        }
        Ok(())
    }
}
