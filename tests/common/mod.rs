//! In-process servers used by the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const VERSION5: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPT: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Start a SOCKS5-only proxy (no auth, CONNECT only) that dials targets directly.
/// SOCKS4 greetings are dropped.
pub async fn socks5_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = handle_socks5(stream).await;
                });
            }
        }
    });
    addr
}

async fn handle_socks5(mut stream: TcpStream) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != VERSION5 {
        return Ok(());
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await?;
        return Ok(());
    }
    stream.write_all(&[VERSION5, AUTH_NONE]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let target = read_address(&mut stream, header[3]).await?;
    if header[1] != CMD_CONNECT {
        return send_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await;
    }

    let mut remote = match TcpStream::connect(&target).await {
        Ok(remote) => remote,
        Err(_) => return send_reply(&mut stream, REP_GENERAL_FAILURE).await,
    };
    send_reply(&mut stream, REP_SUCCESS).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    Ok(())
}

async fn read_address(stream: &mut TcpStream, atyp: u8) -> io::Result<String> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(format!("{}.{}.{}.{}:{}", buf[0], buf[1], buf[2], buf[3], port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let host = String::from_utf8_lossy(&buf[..len]).into_owned();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            Ok(format!("{}:{}", host, port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(format!("[{}]:{}", Ipv6Addr::from(octets), port))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "bad address type")),
    }
}

async fn send_reply(stream: &mut TcpStream, rep: u8) -> io::Result<()> {
    stream
        .write_all(&[VERSION5, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

const VERSION4: u8 = 0x04;
const REP4_GRANTED: u8 = 0x5A;
const REP4_REJECTED: u8 = 0x5B;

/// Start a SOCKS4/4a-only proxy (CONNECT only). SOCKS5 greetings are dropped.
pub async fn socks4_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = handle_socks4(stream).await;
                });
            }
        }
    });
    addr
}

async fn handle_socks4(mut stream: TcpStream) -> io::Result<()> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header[..1]).await?;
    if header[0] != VERSION4 {
        return Ok(());
    }
    stream.read_exact(&mut header[1..]).await?;
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = [header[4], header[5], header[6], header[7]];
    let _user_id = read_nul_terminated(&mut stream).await?;
    // 0.0.0.x with x != 0 marks a SOCKS4a request carrying a hostname
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        read_nul_terminated(&mut stream).await?
    } else {
        format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])
    };

    let reply = |rep: u8| [0x00, rep, 0, 0, 0, 0, 0, 0];
    if header[1] != CMD_CONNECT {
        return stream.write_all(&reply(REP4_REJECTED)).await;
    }
    let mut remote = match TcpStream::connect((host.as_str(), port)).await {
        Ok(remote) => remote,
        Err(_) => return stream.write_all(&reply(REP4_REJECTED)).await,
    };
    stream.write_all(&reply(REP4_GRANTED)).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    Ok(())
}

async fn read_nul_terminated(stream: &mut TcpStream) -> io::Result<String> {
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.push(byte);
    }
}

/// Start a plain-text HTTP server answering every request with `127.0.0.1`.
/// Returns its URL.
pub async fn ip_echo_server() -> String {
    ip_echo_server_with_delay(Duration::ZERO).await
}

/// Like [`ip_echo_server`], but each answer is held back by `delay`.
pub async fn ip_echo_server_with_delay(delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    tokio::time::sleep(delay).await;
                    let body = "127.0.0.1";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        }
    });
    format!("http://{}/", addr)
}

/// Start a TCP server that writes back whatever it reads.
pub async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        }
    });
    addr
}

/// An address nothing listens on.
pub fn closed_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
