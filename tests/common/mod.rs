//! Minimal WebSocket servers for exercising the client engines end to end.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

pub type WsConn = WebSocketStream<TcpStream>;

pub struct TestServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Accept connections forever, handing each upgraded socket and its
    /// request path to `handler` on its own task.
    pub async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(WsConn, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&accepted);
        let handler = Arc::new(handler);
        let task = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                count.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let path = Arc::new(Mutex::new(String::new()));
                    let p = Arc::clone(&path);
                    let record_path =
                        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            *p.lock() = req.uri().path().to_string();
                            Ok(resp)
                        };
                    if let Ok(ws) = accept_hdr_async(tcp, record_path).await {
                        let path = path.lock().clone();
                        (*handler)(ws, path).await;
                    }
                });
            }
        });
        Self {
            addr,
            accepted,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn control_url(&self) -> String {
        format!("ws://{}/control", self.addr)
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bytes 0, 1, 2, ... wrapping, so misplaced blocks show up in comparisons.
pub fn pattern(size: usize) -> Vec<u8> {
    let mut val: u8 = 0;
    (0..size)
        .map(|_| {
            let b = val;
            val = val.wrapping_add(7);
            b
        })
        .collect()
}
