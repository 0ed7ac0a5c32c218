// src/main.rs

use clap::{CommandFactory, FromArgMatches};
use colored::*;
use multisocks_dl::{cli::Cli, error::AppError, run_from_cli};
use std::{env, sync::Arc};

#[tokio::main]
async fn main() {
    // 为 Windows 终端启用 ANSI 颜色支持。
    #[cfg(windows)]
    {
        colored::control::set_virtual_terminal(true).ok();
    }

    let bin_name = env::var("CARGO_BIN_NAME").unwrap_or_else(|_| "multisocks-dl".to_string());

    let after_help = format!(
        "示例:\n  # 下载文件 (10 线程，自动使用已配置的代理)\n  {bin} --url \"https://example.com/file.iso\"\n\n  # 直连下载到指定目录\n  {bin} --url \"https://...\" --no-proxy -o ~/Downloads -t 4\n\n  # 添加并测试代理\n  {bin} --add-proxy hk=127.0.0.1:1080\n  {bin} --test-proxies\n\n  # 查看并继续未完成的任务\n  {bin} --list\n  {bin} --resume",
        bin = bin_name
    );

    let cmd = Cli::command().after_help(after_help);
    let args = match Cli::from_arg_matches(&cmd.get_matches()) {
        Ok(args) => Arc::new(args),
        Err(e) => e.exit(),
    };

    match run_from_cli(args).await {
        Ok(()) => {}
        Err(AppError::UserInterrupt) => {
            println!("\n{} 用户强制中断程序，进度已保存。", "[!]".yellow());
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("\n{} {}", "[X]".red(), format!("程序执行出错: {}", e).red());
            std::process::exit(1);
        }
    }
}
