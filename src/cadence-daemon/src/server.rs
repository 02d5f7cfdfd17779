//! Line-oriented command server.
//!
//! Each client gets a greeting line, then sends one command per line. Every
//! command is answered with a length-prefixed reply:
//!
//! ```text
//! ACK OK <len>\n<body>\n
//! ACK Oops <len>\n<body>\n
//! ```

use crate::error::{CommandError, DaemonError};
use crate::line::{read_line, MAX_LINE_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const COMMAND_PROTOCOL_VERSION: &str = "1.0";

/// A parsed request line: the command word and the raw remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub name: &'a str,
    pub arg: Option<&'a str>,
}

impl<'a> Request<'a> {
    /// Returns `None` for blank lines.
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, arg) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, Some(rest.trim()).filter(|rest| !rest.is_empty())),
            None => (line, None),
        };
        Some(Self { name, arg })
    }
}

/// Executes requests on behalf of connected clients.
pub trait CommandHandler: Send + Sync {
    /// Returns the reply body.
    fn handle(&self, request: &Request<'_>) -> Result<String, CommandError>;
}

/// A bound command listener.
pub struct CommandServer {
    listener: TcpListener,
    handler: Arc<dyn CommandHandler>,
    io_timeout: Duration,
}

impl std::fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServer")
            .field("listener", &self.listener)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl CommandServer {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn CommandHandler>,
        io_timeout: Duration,
    ) -> Result<Self, DaemonError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind {
                service: "command server",
                addr,
                source,
            })?;
        Ok(Self {
            listener,
            handler,
            io_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "command server listening");
        }
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "command client connected");
                    let handler = Arc::clone(&self.handler);
                    let cancel = cancel.child_token();
                    let io_timeout = self.io_timeout;
                    tokio::spawn(async move {
                        if let Err(err) =
                            serve_connection(stream, handler, io_timeout, cancel).await
                        {
                            tracing::debug!(%peer, error = %err, "command connection ended with error");
                        }
                        tracing::debug!(%peer, "command client disconnected");
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "command accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        tracing::info!("command server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn CommandHandler>,
    io_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let greeting = format!("OK cadence {COMMAND_PROTOCOL_VERSION}\n");
    write_timed(&mut writer, greeting.as_bytes(), io_timeout).await?;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = tokio::time::timeout(io_timeout, read_line(&mut reader, MAX_LINE_BYTES)) => line,
        };
        let line = match line {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::debug!("command client idle; closing");
                break;
            }
        };
        let Some(request) = Request::parse(&line) else {
            continue;
        };

        if request.name == "quit" {
            write_timed(&mut writer, &frame_reply(Ok("bye")), io_timeout).await?;
            break;
        }

        let result = handler.handle(&request);
        if let Err(err) = &result {
            tracing::debug!(command = request.name, error = %err, "command failed");
        }
        let reply = frame_reply(result.as_deref().map_err(ToString::to_string));
        write_timed(&mut writer, &reply, io_timeout).await?;
    }

    let _ = writer.shutdown().await;
    Ok(())
}

fn frame_reply(result: Result<&str, String>) -> Vec<u8> {
    let (status, body) = match &result {
        Ok(body) => ("OK", *body),
        Err(message) => ("Oops", message.as_str()),
    };
    format!("ACK {status} {}\n{body}\n", body.len()).into_bytes()
}

async fn write_timed<W>(writer: &mut W, bytes: &[u8], io_timeout: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(io_timeout, writer.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    struct Echo;

    impl CommandHandler for Echo {
        fn handle(&self, request: &Request<'_>) -> Result<String, CommandError> {
            match request.name {
                "echo" => Ok(request.arg.unwrap_or_default().to_string()),
                other => Err(CommandError::Unknown(other.to_string())),
            }
        }
    }

    async fn start(io_timeout: Duration) -> (SocketAddr, CancellationToken) {
        let server = CommandServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Echo), io_timeout)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (addr, cancel)
    }

    async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
        let mut stream = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut greeting = String::new();
        stream.read_line(&mut greeting).await.unwrap();
        assert_eq!(greeting, "OK cadence 1.0\n");
        stream
    }

    async fn reply(stream: &mut BufReader<TcpStream>) -> (String, String) {
        let mut header = String::new();
        stream.read_line(&mut header).await.unwrap();
        let mut parts = header.trim_end().splitn(3, ' ');
        assert_eq!(parts.next(), Some("ACK"));
        let status = parts.next().unwrap().to_string();
        let len: usize = parts.next().unwrap().parse().unwrap();
        let mut body = vec![0; len + 1];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(body.pop(), Some(b'\n'));
        (status, String::from_utf8(body).unwrap())
    }

    #[test]
    fn parses_requests() {
        assert_eq!(Request::parse("   "), None);
        assert_eq!(
            Request::parse("status"),
            Some(Request { name: "status", arg: None })
        );
        assert_eq!(
            Request::parse("play  cadence://local/songs//a b.mp3  # A - B"),
            Some(Request {
                name: "play",
                arg: Some("cadence://local/songs//a b.mp3  # A - B"),
            })
        );
    }

    #[test]
    fn replies_carry_byte_length() {
        assert_eq!(frame_reply(Ok("héllo")), b"ACK OK 6\nh\xc3\xa9llo\n".to_vec());
        assert_eq!(frame_reply(Err("bad".into())), b"ACK Oops 3\nbad\n".to_vec());
    }

    #[tokio::test]
    async fn answers_commands_and_errors() {
        let (addr, cancel) = start(Duration::from_secs(5)).await;
        let mut stream = connect(addr).await;

        stream.get_mut().write_all(b"echo multi\nline?\n").await.unwrap();
        assert_eq!(reply(&mut stream).await, ("OK".into(), "multi".into()));
        assert_eq!(
            reply(&mut stream).await,
            ("Oops".into(), "unknown command 'line?'".into())
        );

        stream.get_mut().write_all(b"\nquit\n").await.unwrap();
        assert_eq!(reply(&mut stream).await, ("OK".into(), "bye".into()));
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn idle_clients_are_disconnected() {
        let (addr, cancel) = start(Duration::from_millis(200)).await;
        let mut stream = connect(addr).await;
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .expect("server should close an idle connection");
        assert_eq!(read.unwrap(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn overlong_line_closes_only_that_client() {
        let (addr, cancel) = start(Duration::from_secs(5)).await;
        let mut other = connect(addr).await;
        let mut noisy = connect(addr).await;

        let long = format!("echo {}\n", "x".repeat(MAX_LINE_BYTES + 1));
        let _ = noisy.get_mut().write_all(long.as_bytes()).await;
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), noisy.read_to_end(&mut rest))
            .await
            .expect("noisy client should be disconnected");
        assert!(rest.is_empty());

        other.get_mut().write_all(b"echo still here\n").await.unwrap();
        assert_eq!(reply(&mut other).await, ("OK".into(), "still here".into()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_bind_on_same_port_is_a_bind_error() {
        let first = CommandServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Echo),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let addr = first.local_addr().unwrap();
        let second = CommandServer::bind(addr, Arc::new(Echo), Duration::from_secs(1)).await;
        assert!(matches!(
            second,
            Err(DaemonError::Bind { service: "command server", .. })
        ));
    }
}
