// src/config/store.rs

use crate::{
    config::ExternalConfig,
    constants,
    error::{AppError, AppResult},
    proxy::ProxyEndpoint,
};
use anyhow::{Context, anyhow};
use log::info;
use serde_json::Value;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

pub(crate) fn get_config_dir() -> AppResult<PathBuf> {
    let dir = dirs::home_dir()
        .ok_or_else(|| AppError::Other(anyhow!("无法获取用户主目录")))?
        .join(constants::CONFIG_DIR_NAME);
    Ok(dir)
}

pub(crate) fn get_config_path() -> AppResult<PathBuf> {
    Ok(get_config_dir()?.join(constants::CONFIG_FILE_NAME))
}

pub(crate) fn load_or_create_external_config(config_path: &Path) -> AppResult<ExternalConfig> {
    if config_path.is_file() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("读取配置文件 '{}' 失败", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件 '{}' 失败", config_path.display()))
            .map_err(AppError::from)
    } else {
        info!("配置文件 {:?} 不存在，将创建默认配置。", config_path);
        let config = ExternalConfig::default_app_config();
        save_external_config(config_path, &config)?;
        Ok(config)
    }
}

pub(crate) fn save_external_config(config_path: &Path, config: &ExternalConfig) -> AppResult<()> {
    write_json(config_path, &serde_json::to_value(config)?)
}

/// 经同目录临时文件原子替换配置文件。
fn write_json(config_path: &Path, value: &Value) -> AppResult<()> {
    let dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(config_path)
        .with_context(|| format!("写入配置文件 '{}' 失败", config_path.display()))?;
    Ok(())
}

/// 仅替换配置文件中的代理列表，其余内容（包括未知字段）保持原样。
pub fn save_proxies(config_path: &Path, proxies: &[ProxyEndpoint]) -> AppResult<()> {
    let mut root = if config_path.is_file() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("读取配置文件 '{}' 失败", config_path.display()))?;
        serde_json::from_str::<Value>(&content)
            .with_context(|| format!("解析配置文件 '{}' 失败", config_path.display()))?
    } else {
        serde_json::to_value(ExternalConfig::default_app_config())?
    };
    let Some(fields) = root.as_object_mut() else {
        return Err(AppError::Other(anyhow!(
            "配置文件 '{}' 的顶层不是 JSON 对象",
            config_path.display()
        )));
    };
    fields.insert("proxies".to_string(), serde_json::to_value(proxies)?);
    write_json(config_path, &root)?;
    info!("已将 {} 个代理写入配置文件: {}", proxies.len(), config_path.display());
    Ok(())
}
