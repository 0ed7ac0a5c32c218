// src/cli.rs

use clap::{Parser, ValueEnum, command, crate_version};
use std::path::PathBuf;

/// 定义日志输出级别
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug, Clone)]
#[command(
    version = crate_version!(),
    about,
    long_about = None,
    arg_required_else_help = true,
    disable_help_flag = true,
    disable_version_flag = true,
)]
#[command(group(
    clap::ArgGroup::new("mode")
        .required(true)
        .args(&["url", "resume", "list", "cancel", "remove", "proxies", "add_proxy", "remove_proxy", "test_proxies"]),
))]
pub struct Cli {
    // --- 运行模式 (Mode) ---
    /// 新建下载任务并等待其完成
    #[arg(long, help_heading = "Mode")]
    pub url: Option<String>,
    /// 继续未完成的任务；不指定 ID 时继续全部
    #[arg(long, value_name = "ID", num_args = 0..=1, default_missing_value = "", help_heading = "Mode")]
    pub resume: Option<String>,
    /// 列出所有未完成的任务
    #[arg(short, long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub list: bool,
    /// 取消任务并删除已下载的部分
    #[arg(long, value_name = "ID", help_heading = "Mode")]
    pub cancel: Option<String>,
    /// 从任务列表中移除任务
    #[arg(long, value_name = "ID", help_heading = "Mode")]
    pub remove: Option<String>,
    /// 列出已配置的 SOCKS5 代理
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub proxies: bool,
    /// 添加代理，格式 NAME=HOST:PORT
    #[arg(long, value_name = "NAME=HOST:PORT", help_heading = "Mode")]
    pub add_proxy: Option<String>,
    /// 按名称删除代理
    #[arg(long, value_name = "NAME", help_heading = "Mode")]
    pub remove_proxy: Option<String>,
    /// 测试所有代理的连通性与延迟
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub test_proxies: bool,

    // --- 下载选项 (Options) ---
    /// 设置文件保存目录
    #[arg(short, long, value_name = "DIR", help_heading = "Options")]
    pub output: Option<PathBuf>,
    /// 指定保存的文件名（默认取自服务器或链接）
    #[arg(long, help_heading = "Options")]
    pub filename: Option<String>,
    /// 每个任务的分片线程数 (1-32)
    #[arg(short, long, value_parser = clap::value_parser!(usize), help_heading = "Options")]
    pub threads: Option<usize>,
    /// 不使用代理，全部直连
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Options")]
    pub no_proxy: bool,
    /// 所有任务合计的最大并发连接数
    #[arg(short, long, value_parser = clap::value_parser!(usize), help_heading = "Options")]
    pub workers: Option<usize>,

    // --- 通用选项 (General) ---
    /// 显示此帮助信息并退出
    #[arg(short = 'h', long, action = clap::ArgAction::Help, global = true, help_heading = "General")]
    _help: Option<bool>,
    /// 显示版本信息并退出
    #[arg(short = 'V', long, action = clap::ArgAction::Version, global = true, help_heading = "General")]
    _version: Option<bool>,
    /// (隐藏参数) 设置日志文件的输出级别，用于调试
    #[arg(long, value_enum, default_value_t = LogLevel::Off, global = true, hide = true)]
    pub log_level: LogLevel,
}

impl Cli {
    /// `--resume` 指定的任务 ID；`Some(None)` 表示继续全部任务。
    pub fn resume_target(&self) -> Option<Option<&str>> {
        self.resume
            .as_deref()
            .map(|id| Some(id.trim()).filter(|id| !id.is_empty()))
    }
}
