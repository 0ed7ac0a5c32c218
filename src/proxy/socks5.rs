// src/proxy/socks5.rs

//! 最小化的 SOCKS5 客户端握手 (RFC 1928)，仅支持无认证方式与 CONNECT 命令。

use super::{ProxyEndpoint, ProxyFailureKind};
use log::{debug, trace};
use std::{io, net::IpAddr};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("无法连接代理: {0}")]
    Connect(#[source] io::Error),
    #[error("握手过程中连接中断: {0}")]
    Handshake(#[source] io::Error),
    #[error("代理拒绝请求: {0}")]
    Rejected(String),
}

impl Socks5Error {
    pub fn failure_kind(&self) -> ProxyFailureKind {
        match self {
            Socks5Error::Connect(e) if e.kind() == io::ErrorKind::TimedOut => {
                ProxyFailureKind::ConnectTimeout
            }
            Socks5Error::Connect(_) => ProxyFailureKind::RefusedConnection,
            Socks5Error::Handshake(_) | Socks5Error::Rejected(_) => {
                ProxyFailureKind::HandshakeRejected
            }
        }
    }
}

impl From<Socks5Error> for io::Error {
    fn from(err: Socks5Error) -> Self {
        let kind = match &err {
            Socks5Error::Connect(e) | Socks5Error::Handshake(e) => e.kind(),
            Socks5Error::Rejected(_) => io::ErrorKind::ConnectionRefused,
        };
        io::Error::new(kind, err)
    }
}

/// 对 `Transport::connect` 返回的错误分类，优先使用其中保留的握手错误。
pub fn failure_kind_of(err: &io::Error) -> ProxyFailureKind {
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<Socks5Error>()) {
        return inner.failure_kind();
    }
    match err.kind() {
        io::ErrorKind::TimedOut => ProxyFailureKind::ConnectTimeout,
        io::ErrorKind::ConnectionRefused => ProxyFailureKind::RefusedConnection,
        _ => ProxyFailureKind::HandshakeRejected,
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// 构造 CONNECT 请求报文。
fn connect_request(target_host: &str, target_port: u16) -> Result<Vec<u8>, Socks5Error> {
    let mut req = vec![VERSION, CMD_CONNECT, 0x00];
    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(target_host.len())
                .map_err(|_| Socks5Error::Rejected(format!("目标主机名过长: {}", target_host)))?;
            req.push(ATYP_DOMAIN);
            req.push(len);
            req.extend_from_slice(target_host.as_bytes());
        }
    }
    req.extend_from_slice(&target_port.to_be_bytes());
    Ok(req)
}

/// 通过代理建立到 `target_host:target_port` 的隧道，返回可直接读写的流。
pub async fn connect(
    proxy: &ProxyEndpoint,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, Socks5Error> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(Socks5Error::Connect)?;
    stream.set_nodelay(true).ok();
    trace!("已连接代理 '{}'，开始握手", proxy.name);

    stream
        .write_all(&[VERSION, 1, METHOD_NO_AUTH])
        .await
        .map_err(Socks5Error::Handshake)?;
    let mut method = [0u8; 2];
    stream
        .read_exact(&mut method)
        .await
        .map_err(Socks5Error::Handshake)?;
    if method[0] != VERSION {
        return Err(Socks5Error::Rejected(format!("不支持的协议版本: {}", method[0])));
    }
    if method[1] != METHOD_NO_AUTH {
        return Err(Socks5Error::Rejected("代理要求认证".to_string()));
    }

    let request = connect_request(target_host, target_port)?;
    stream
        .write_all(&request)
        .await
        .map_err(Socks5Error::Handshake)?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(Socks5Error::Handshake)?;
    if head[1] != 0x00 {
        return Err(Socks5Error::Rejected(reply_message(head[1]).to_string()));
    }

    // 读掉 BND.ADDR 与 BND.PORT
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(Socks5Error::Handshake)?;
            len[0] as usize
        }
        other => {
            return Err(Socks5Error::Rejected(format!("未知的地址类型: {}", other)));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(Socks5Error::Handshake)?;

    debug!(
        "代理 '{}' 已建立到 {}:{} 的隧道",
        proxy.name, target_host, target_port
    );
    Ok(stream)
}
