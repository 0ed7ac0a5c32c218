// src/ui.rs

use crate::{
    constants,
    models::{ProgressEvent, Task},
    proxy::{Liveness, ProxyEndpoint, ProxyTestResult},
    symbols, utils,
};
use colored::*;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use itertools::Itertools;

pub fn print_header(title: &str) {
    println!("\n{}", "═".repeat(constants::UI_WIDTH));
    println!(" {}", title.cyan().bold());
    println!("{}", "═".repeat(constants::UI_WIDTH));
}

pub fn print_sub_header(title: &str) {
    println!("\n--- {} ---", title.bold());
}

pub fn box_message(title: &str, content: &[&str], color_func: fn(ColoredString) -> ColoredString) {
    println!("\n┌{}┐", "─".repeat(constants::UI_WIDTH - 2));
    println!("  {}", color_func(title.bold()));
    println!("├{}┤", "─".repeat(constants::UI_WIDTH - 2));
    for line in content {
        println!("  {}", line);
    }
    println!("└{}┘", "─".repeat(constants::UI_WIDTH - 2));
}

fn progress_text(bytes: u64, total: Option<u64>) -> String {
    match total {
        Some(0) => "0 B".to_string(),
        Some(total) => format!(
            "{} / {} ({:.1}%)",
            HumanBytes(bytes),
            HumanBytes(total),
            bytes as f64 * 100.0 / total as f64
        ),
        None => format!("{} / 未知", HumanBytes(bytes)),
    }
}

pub fn print_task_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("\n{} 没有未完成的任务。", *symbols::INFO);
        return;
    }
    print_header(&format!("任务列表 ({})", tasks.len()));
    for task in tasks {
        let (symbol, color, label) = task.status.get_display_info();
        println!(
            "{} {} {}",
            symbol,
            color(label.into()),
            utils::truncate_text(&task.filename, constants::FILENAME_TRUNCATE_LENGTH).bold()
        );
        println!("    ID:   {}", task.id.dimmed());
        println!("    链接: {}", task.url);
        println!(
            "    进度: {}，{} 个分片，{} 线程{}",
            progress_text(task.bytes_written(), task.total_size),
            task.segments.len(),
            task.thread_count,
            if task.use_proxies { "" } else { "，直连" }
        );
        let proxies = task
            .segments
            .iter()
            .filter_map(|s| s.proxy.as_deref())
            .unique()
            .join(", ");
        if !proxies.is_empty() {
            println!("    代理: {}", proxies);
        }
        if let Some(failure) = &task.failure {
            println!("    {}", format!("原因: {} ({})", failure.cause, failure.message).red());
        }
    }
}

pub fn print_proxy_table(proxies: &[(ProxyEndpoint, Liveness)]) {
    if proxies.is_empty() {
        println!("\n{} 尚未配置任何代理，下载将全部直连。", *symbols::INFO);
        return;
    }
    print_header(&format!("SOCKS5 代理 ({})", proxies.len()));
    for (endpoint, liveness) in proxies {
        let state = match liveness {
            Liveness::Untested => "未测试".dimmed(),
            Liveness::Reachable { latency_ms } => format!("可用 {} ms", latency_ms).green(),
            Liveness::Unreachable { kind } => format!("不可用: {}", kind).red(),
        };
        println!("{} {:<40} {}", *symbols::PROXY, endpoint.to_string(), state);
    }
}

pub fn print_proxy_test_results(results: &[ProxyTestResult]) {
    print_sub_header("代理测试结果");
    for result in results {
        match (result.reachable, result.latency, result.failure) {
            (true, Some(latency), _) => println!(
                "{} {:<20} 延迟 {} ms",
                *symbols::OK,
                result.name,
                latency.as_millis()
            ),
            (_, _, Some(kind)) => println!("{} {:<20} {}", *symbols::ERROR, result.name, kind),
            _ => println!("{} {:<20} 未知", *symbols::WARN, result.name),
        }
    }
    let ok = results.iter().filter(|r| r.reachable).count();
    println!("\n{} {}/{} 个代理可用。", *symbols::INFO, ok, results.len());
}

/// 单个任务的字节进度条；大小未知时使用不定长样式。
pub fn new_bytes_progress_bar(total: Option<u64>, prefix: &str) -> ProgressBar {
    let pbar = match total {
        Some(total) => {
            let style = ProgressStyle::with_template(
                "{prefix:7.bold.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>10}/{total_bytes:10} ({percent:>3}%) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
            ProgressBar::new(total).with_style(style)
        }
        None => {
            let style = ProgressStyle::with_template(
                "{prefix:7.bold.cyan} [{elapsed_precise}] {spinner} {bytes:>10} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
            ProgressBar::new_spinner().with_style(style)
        }
    };
    pbar.set_prefix(prefix.to_string());
    pbar
}

/// 按最新进度事件刷新进度条。
pub fn update_progress_bar(pbar: &ProgressBar, event: &ProgressEvent) {
    if let Some(total) = event.total_size
        && pbar.length() != Some(total)
    {
        pbar.set_length(total);
    }
    pbar.set_position(event.bytes_written);
    pbar.set_message(format!(
        "{} {}",
        utils::format_speed(event.throughput),
        event.status
    ));
}

pub fn print_task_result(task: &Task) {
    let (symbol, color, label) = task.status.get_display_info();
    let line = format!(
        "{} {}: {}",
        label,
        utils::truncate_text(&task.filename, constants::FILENAME_TRUNCATE_LENGTH),
        progress_text(task.bytes_written(), task.total_size)
    );
    println!("{} {}", symbol, color(line.as_str().into()));
    if let Some(failure) = &task.failure {
        println!("    {}", format!("{}: {}", failure.cause, failure.message).red());
    }
}
