//! Client side of the control socket.

use crate::error::{Error, Result};
use crate::protocol::{self, Request, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;

/// Send one request to the daemon at `socket_path` and wait for its response.
pub async fn send(socket_path: &Path, request: &Request) -> Result<Response> {
    let mut stream = UnixStream::connect(socket_path).await?;
    protocol::write_request(&mut stream, request).await?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await?;
    if line.is_empty() {
        return Err(Error::Decode(
            "connection closed without a response".to_string(),
        ));
    }

    serde_json::from_str(line.trim()).map_err(|e| Error::Decode(e.to_string()))
}
