// src/utils.rs

use crate::{
    constants,
    error::{AppError, AppResult},
};
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::{ffi::OsStr, path::Path, sync::LazyLock};
use url::Url;

static ILLEGAL_CHARS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|\x00-\x1f]"#).unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static CD_EXTENDED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\*\s*=\s*([\w-]+)'[^']*'([^;]+)"#).unwrap());
static CD_QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\s*=\s*"([^"]*)""#).unwrap());
static CD_PLAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\s*=\s*([^";]+)"#).unwrap());

pub fn sanitize_filename(name: &str) -> String {
    let original_name = name.trim();
    if original_name.is_empty() { return constants::DEFAULT_FILENAME.to_string(); }

    let stem = Path::new(original_name)
        .file_stem()
        .unwrap_or_else(|| OsStr::new(original_name))
        .to_string_lossy()
        .to_uppercase();
    let windows_reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let mut name = if windows_reserved.contains(&stem.as_ref()) {
        format!("_{}", original_name)
    } else {
        original_name.to_string()
    };

    name = ILLEGAL_CHARS_RE.replace_all(&name, "_").into_owned();
    name = WHITESPACE_RE.replace_all(&name, " ").trim().to_string();
    name = name.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string();
    if name.is_empty() { return constants::DEFAULT_FILENAME.to_string(); }

    if name.len() > constants::MAX_FILENAME_BYTES {
        let path = Path::new(&name);
        name = match (path.file_stem(), path.extension()) {
            (Some(stem_part), Some(ext)) => {
                let ext_str = format!(".{}", ext.to_string_lossy());
                let max_stem_bytes = constants::MAX_FILENAME_BYTES.saturating_sub(ext_str.len());
                format!("{}{}", safe_truncate_utf8(&stem_part.to_string_lossy(), max_stem_bytes), ext_str)
            }
            _ => safe_truncate_utf8(&name, constants::MAX_FILENAME_BYTES).to_string(),
        };
    }
    name
}

fn safe_truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes { return s; }
    let mut i = max_bytes;
    while i > 0 && !s.is_char_boundary(i) { i -= 1; }
    &s[..i]
}

pub fn truncate_text(text: &str, max_width: usize) -> String {
    let mut width = 0;
    let mut end_pos = 0;
    for (i, c) in text.char_indices() {
        width += if c.is_ascii() { 1 } else { 2 };
        if width > max_width.saturating_sub(3) {
            end_pos = i;
            break;
        }
    }
    if end_pos == 0 { text.to_string() } else { format!("{}...", &text[..end_pos]) }
}

/// 取 URL 路径的最后一段作为文件名，取不到时使用默认文件名。
pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .map(|s| sanitize_filename(&s))
        .unwrap_or_else(|| constants::DEFAULT_FILENAME.to_string())
}

/// 解析 `Content-Disposition` 头中的文件名，`filename*` 优先。
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let raw = if let Some(caps) = CD_EXTENDED_RE.captures(header) {
        let charset = caps[1].to_ascii_lowercase();
        let value = caps[2].trim();
        if charset == "utf-8" {
            percent_decode_str(value).decode_utf8_lossy().into_owned()
        } else {
            percent_decode_str(value)
                .map(char::from)
                .collect::<String>()
        }
    } else if let Some(caps) = CD_QUOTED_RE.captures(header) {
        caps[1].to_string()
    } else if let Some(caps) = CD_PLAIN_RE.captures(header) {
        caps[1].trim().to_string()
    } else {
        return None;
    };

    // 部分服务器会带上路径，只保留最后一段
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() {
        None
    } else {
        Some(sanitize_filename(base))
    }
}

/// 解析 `Content-Range: bytes START-END/TOTAL`，TOTAL 为 `*` 时返回 `None`。
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

/// 拆分 `host:port`，支持 `[::1]:1080` 形式的 IPv6 地址。
pub fn split_host_port(addr: &str) -> AppResult<(String, u16)> {
    let addr = addr.trim();
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| AppError::InvalidProxy(format!("缺少端口: '{}'", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .parse::<u16>()
        .map_err(|_| AppError::InvalidProxy(format!("无效的端口: '{}'", port)))?;
    if host.is_empty() {
        return Err(AppError::InvalidProxy(format!("缺少主机名: '{}'", addr)));
    }
    Ok((host.to_string(), port))
}

/// 解析命令行中的 `NAME=HOST:PORT`。
pub fn parse_proxy_spec(spec: &str) -> AppResult<(String, String, u16)> {
    let (name, addr) = spec
        .split_once('=')
        .ok_or_else(|| AppError::InvalidProxy(format!("格式应为 NAME=HOST:PORT，实际为 '{}'", spec)))?;
    let (host, port) = split_host_port(addr)?;
    Ok((name.trim().to_string(), host, port))
}

/// 格式化下载速度，例如 `1.50 MiB/s`。
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", indicatif::HumanBytes(bytes_per_sec.max(0.0) as u64))
}
