//! Wire protocol between clients and the daemon.
//!
//! A connection carries exactly one request and one response:
//!
//! 1. Client connects and writes one JSON object (no framing required)
//! 2. Daemon writes one newline-terminated JSON response
//! 3. Daemon closes the connection

use crate::error::{Error, ErrorKind, Result};
use crate::services::registry::{Container, Status};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single encoded request.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Command kinds understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Run,
    Stop,
    Rm,
    Ps,
}

/// A client request. Fields that do not apply to `command` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: CommandKind,
    /// run: locator of the flist image.
    #[serde(rename = "metaURL", default)]
    pub meta_url: String,
    /// run: program to execute inside the mount.
    #[serde(default)]
    pub entrypoint: String,
    /// stop/rm/ps: target container. run: requested container id.
    #[serde(rename = "containerName", default)]
    pub container_name: String,
    /// run: target mount directory.
    #[serde(default)]
    pub mountpoint: String,
}

impl Request {
    pub fn run(
        meta_url: impl Into<String>,
        entrypoint: impl Into<String>,
        container_name: impl Into<String>,
        mountpoint: impl Into<String>,
    ) -> Self {
        Self {
            command: CommandKind::Run,
            meta_url: meta_url.into(),
            entrypoint: entrypoint.into(),
            container_name: container_name.into(),
            mountpoint: mountpoint.into(),
        }
    }

    pub fn stop(container_name: impl Into<String>) -> Self {
        Self::targeted(CommandKind::Stop, container_name.into())
    }

    pub fn rm(container_name: impl Into<String>) -> Self {
        Self::targeted(CommandKind::Rm, container_name.into())
    }

    /// List containers. An empty name lists all of them.
    pub fn ps(container_name: impl Into<String>) -> Self {
        Self::targeted(CommandKind::Ps, container_name.into())
    }

    fn targeted(command: CommandKind, container_name: String) -> Self {
        Self {
            command,
            meta_url: String::new(),
            entrypoint: String::new(),
            container_name,
            mountpoint: String::new(),
        }
    }
}

/// Container as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub path: String,
    pub status: Status,
    #[serde(rename = "metaURL", default)]
    pub meta_url: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl From<Container> for ContainerInfo {
    fn from(c: Container) -> Self {
        ContainerInfo {
            id: c.id,
            path: c.path.to_string_lossy().to_string(),
            status: c.status,
            meta_url: c.meta_url,
            entrypoint: c.entrypoint,
            pid: c.pid,
        }
    }
}

/// The single response written back on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Response {
    Ok {
        #[serde(default)]
        containers: Vec<ContainerInfo>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn containers(containers: Vec<Container>) -> Self {
        Response::Ok {
            containers: containers.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&Error> for Response {
    fn from(e: &Error) -> Self {
        Response::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Read exactly one request from `reader`.
///
/// Bytes are accumulated until they form one complete JSON value; anything
/// after it is ignored. EOF before a complete value is a decode error.
pub async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Decode(format!("read failed: {e}")))?;

        if n == 0 {
            if buf.iter().all(u8::is_ascii_whitespace) {
                return Err(Error::Decode(
                    "connection closed before a command was sent".to_string(),
                ));
            }
            return Err(Error::Decode("unexpected end of command".to_string()));
        }

        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = parse_request(&buf)? {
            return Ok(request);
        }

        if buf.len() > MAX_REQUEST_SIZE {
            return Err(Error::Decode(format!(
                "command exceeds {MAX_REQUEST_SIZE} bytes"
            )));
        }
    }
}

/// Try to parse the first JSON value in `buf`. `None` means more input is needed.
fn parse_request(buf: &[u8]) -> Result<Option<Request>> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Request>();
    match stream.next() {
        None => Ok(None),
        Some(Ok(request)) => Ok(Some(request)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(Error::Decode(e.to_string())),
    }
}

/// Write a request as one JSON line.
pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, request).await
}

/// Write a response as one JSON line.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, response).await
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(value).map_err(io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
