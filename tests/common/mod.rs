// tests/common/mod.rs
#![allow(dead_code)]

use multisocks_dl::config::AppConfig;
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

/// 测试用配置：所有目录都位于给定的临时目录下。
pub fn test_config(root: &Path) -> AppConfig {
    AppConfig {
        save_dir: root.join("downloads"),
        state_dir: root.join("tasks"),
        ..AppConfig::default()
    }
}

/// 可预测的测试数据，便于按偏移核对内容。
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 绑定后立即释放的端口，连接它会被拒绝。
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// --- 假 SOCKS5 代理 ---

pub struct FakeSocks5 {
    pub addr: SocketAddr,
    /// 成功建立的 CONNECT 隧道数量
    pub tunnels: Arc<AtomicUsize>,
}

impl FakeSocks5 {
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }
}

/// 启动一个只支持无认证 CONNECT 的 SOCKS5 中继。
pub async fn spawn_socks5() -> FakeSocks5 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tunnels = Arc::new(AtomicUsize::new(0));
    let counter = tunnels.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let _ = relay(stream, counter).await;
            });
        }
    });
    FakeSocks5 { addr, tunnels }
}

async fn relay(mut client: TcpStream, tunnels: Arc<AtomicUsize>) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        4 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        _ => return Err(io::Error::other("unsupported address type")),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            return Err(e);
        }
    };
    tunnels.fetch_add(1, Ordering::SeqCst);
    client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

// --- 限速的 Range 文件服务器 ---

pub struct RangeServer {
    pub addr: SocketAddr,
    pub requests: Arc<AtomicUsize>,
    /// 同时在传输中的最大 GET 响应数
    pub peak: Arc<AtomicUsize>,
}

impl RangeServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct Counters {
    requests: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// 支持 HEAD 与单区间 Range 的 HTTP/1.1 服务器，每写出 `chunk` 字节暂停 `delay`。
pub async fn spawn_range_server(data: Vec<u8>, chunk: usize, delay: Duration) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counters = Counters::default();
    let server = RangeServer {
        addr,
        requests: counters.requests.clone(),
        peak: counters.peak.clone(),
    };
    let data = Arc::new(data);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let data = data.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                let _ = serve_ranges(stream, data, chunk, delay, counters).await;
            });
        }
    });
    server
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => total - 1,
        e => e.parse::<u64>().ok()?.min(total - 1),
    };
    (start <= end).then_some((start, end))
}

async fn serve_ranges(
    stream: TcpStream,
    data: Arc<Vec<u8>>,
    chunk: usize,
    delay: Duration,
    counters: Counters,
) -> io::Result<()> {
    let total = data.len() as u64;
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut range = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':')
                && name.eq_ignore_ascii_case("range")
            {
                range = parse_range(value, total);
            }
        }
        counters.requests.fetch_add(1, Ordering::SeqCst);

        let (status, start, end) = match range {
            Some((start, end)) => ("206 Partial Content", start, end),
            None => ("200 OK", 0, total - 1),
        };
        let mut header = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n",
            status,
            end - start + 1
        );
        if range.is_some() {
            header.push_str(&format!("Content-Range: bytes {}-{}/{}\r\n", start, end, total));
        }
        header.push_str("\r\n");

        let stream = reader.get_mut();
        stream.write_all(header.as_bytes()).await?;
        if !request_line.starts_with("HEAD") {
            let body = &data[start as usize..=end as usize];
            let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            counters.peak.fetch_max(now, Ordering::SeqCst);
            // 最后一块写出前就结束计数，保证计数区间落在客户端读完之前
            let (head, last) = body.split_at(body.len().saturating_sub(chunk.min(body.len())));
            let written = write_chunks(stream, head, chunk, delay).await;
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            written?;
            stream.write_all(last).await?;
        }
        stream.flush().await?;
    }
}

async fn write_chunks(stream: &mut TcpStream, body: &[u8], chunk: usize, delay: Duration) -> io::Result<()> {
    for piece in body.chunks(chunk) {
        stream.write_all(piece).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}
