//! Fixtures shared by backend and engine tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use super::{ExecutorOptions, ProtocolResources};
use crate::catalog::DiskCatalog;
use crate::config::EngineOptions;
use crate::models::TemplateInfo;

pub fn resources() -> ProtocolResources {
    ProtocolResources::new(Arc::new(EngineOptions::for_tests()), Arc::new(DiskCatalog::new(".", false)))
}

pub fn executor_options(template_id: &str) -> ExecutorOptions {
    ExecutorOptions::new(template_id, TemplateInfo::default(), &resources())
}

/// Serve HTTP/1.1 on a random local port, answering each request with
/// `handler(request head)` as `(status, body)`. Returns the base URL.
pub async fn http_fixture<F>(handler: F) -> String
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                while read < buf.len() {
                    let n = stream.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf[..read]).to_string();
                let (status, body) = handler(&head);
                let response = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: text/plain\r\nX-Fixture: yes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

/// Request line path of a raw request head, e.g. `/admin?t=1`.
pub fn request_path(head: &str) -> String {
    head.split_whitespace().nth(1).unwrap_or("/").to_string()
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Answer A queries over UDP from `records`; other names get NXDOMAIN.
pub async fn dns_fixture(records: HashMap<String, [u8; 4]>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            if let Some(reply) = dns_reply(&buf[..len], &records) {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });
    addr
}

fn dns_reply(query: &[u8], records: &HashMap<String, [u8; 4]>) -> Option<Vec<u8>> {
    let mut labels = Vec::new();
    let mut pos = 12;
    loop {
        let len = *query.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        labels.push(String::from_utf8_lossy(query.get(pos..pos + len)?).to_ascii_lowercase());
        pos += len;
    }
    let question_end = pos + 4;
    let question = query.get(12..question_end)?;
    let answer = records.get(&labels.join("."));

    let mut reply = Vec::with_capacity(64);
    reply.extend_from_slice(&query[..2]);
    reply.extend_from_slice(if answer.is_some() { &[0x81, 0x80] } else { &[0x81, 0x83] });
    reply.extend_from_slice(&[0, 1, 0, u8::from(answer.is_some()), 0, 0, 0, 0]);
    reply.extend_from_slice(question);
    if let Some(ip) = answer {
        reply.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
        reply.extend_from_slice(ip);
    }
    Some(reply)
}
