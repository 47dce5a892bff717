//! In-process NNTP test server
//!
//! A scripted line-based server: each received command line is handed to
//! the test's handler, which picks the reply shape. The accept loop serves
//! any number of connections so pooled clients and backup servers can be
//! exercised.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// How the server answers one command
pub enum Reply {
    /// Single status line
    Status(String),
    /// Status line, body lines (dot-stuffed as needed), terminator
    Multiline {
        /// Status line
        status: String,
        /// Body lines without terminators
        lines: Vec<String>,
    },
    /// Status line, raw body bytes, terminator (compressed-body tests)
    Raw {
        /// Status line
        status: String,
        /// On-wire body bytes, terminator excluded
        bytes: Vec<u8>,
    },
    /// POST flow: go-ahead, swallow the article until `.`, then verdict
    ReadThenStatus {
        /// 340 go-ahead line
        go_ahead: String,
        /// Final verdict line
        verdict: String,
    },
    /// Close the connection without replying
    Close,
}

/// Command handler shared across connections
pub type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// A running mock server
pub struct MockServer {
    /// Bound port
    pub port: u16,
    /// Commands received across all connections
    pub commands: Arc<std::sync::Mutex<Vec<String>>>,
    /// Connections accepted so far
    pub connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Spawn a server answering `welcome` on connect and `handler` per command
    pub async fn spawn(welcome: &str, handler: Handler) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let welcome = welcome.to_string();
        let commands: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let connections = Arc::new(AtomicUsize::new(0));

        let log = commands.clone();
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let welcome = welcome.clone();
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, welcome, handler, log).await;
                });
            }
        });

        MockServer {
            port,
            commands,
            connections,
        }
    }

    /// Commands seen so far
    pub fn seen(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    welcome: String,
    handler: Handler,
    log: Arc<std::sync::Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(format!("{}\r\n", welcome).as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        log.lock().expect("commands lock").push(command.clone());

        match handler(&command) {
            Reply::Status(status) => {
                write_half
                    .write_all(format!("{}\r\n", status).as_bytes())
                    .await?;
            }
            Reply::Multiline { status, lines } => {
                let mut out = format!("{}\r\n", status);
                for body_line in lines {
                    if body_line.starts_with('.') {
                        out.push('.');
                    }
                    out.push_str(&body_line);
                    out.push_str("\r\n");
                }
                out.push_str(".\r\n");
                write_half.write_all(out.as_bytes()).await?;
            }
            Reply::Raw { status, bytes } => {
                write_half
                    .write_all(format!("{}\r\n", status).as_bytes())
                    .await?;
                write_half.write_all(&bytes).await?;
                write_half.write_all(b".\r\n").await?;
            }
            Reply::ReadThenStatus { go_ahead, verdict } => {
                write_half
                    .write_all(format!("{}\r\n", go_ahead).as_bytes())
                    .await?;
                let mut body_line = String::new();
                loop {
                    body_line.clear();
                    if reader.read_line(&mut body_line).await? == 0 {
                        return Ok(());
                    }
                    if body_line.trim_end() == "." {
                        break;
                    }
                }
                write_half
                    .write_all(format!("{}\r\n", verdict).as_bytes())
                    .await?;
            }
            Reply::Close => return Ok(()),
        }

        if command.eq_ignore_ascii_case("QUIT") {
            return Ok(());
        }
    }
}
