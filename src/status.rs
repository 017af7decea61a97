use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::varint::{self, VarIntError};

#[derive(Debug)]
pub enum StatusError {
    ConnectFailed(std::io::Error),
    Timeout,
    MalformedResponse(String),
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::ConnectFailed(e) => write!(f, "connection failed: {e}"),
            StatusError::Timeout => write!(f, "timed out waiting for status response"),
            StatusError::MalformedResponse(msg) => write!(f, "malformed status response: {msg}"),
        }
    }
}

impl std::error::Error for StatusError {}

impl From<VarIntError> for StatusError {
    fn from(e: VarIntError) -> Self {
        StatusError::MalformedResponse(e.to_string())
    }
}

/// Parsed server-list-ping response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub description: Description,
    pub version: Version,
    pub players: Players,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Description {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Players {
    pub online: u32,
    pub max: u32,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
}

/// Query a Minecraft server's status over the server list ping protocol.
///
/// Opens a short-lived TCP connection, writes a handshake packet and an
/// empty status request, and reads back the length-prefixed JSON status
/// document. The whole operation is bounded by `timeout`; cancellation
/// closes the pending connection. No retries — that's the caller's call.
pub async fn query_status(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<ServerStatus, StatusError> {
    match tokio::time::timeout(timeout, query_inner(host, port)).await {
        Ok(result) => result,
        Err(_) => Err(StatusError::Timeout),
    }
}

async fn query_inner(host: &str, port: u16) -> Result<ServerStatus, StatusError> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(StatusError::ConnectFailed)?;

    stream
        .write_all(&handshake_request(host, port))
        .await
        .map_err(StatusError::ConnectFailed)?;

    let buf = read_response(&mut stream).await?;
    parse_response(&buf)
}

/// Build the handshake packet (state transition to "status") followed by
/// the empty status request packet.
fn handshake_request(host: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 8);
    body.extend(varint::encode(0)); // packet id: handshake
    body.extend(varint::encode(0)); // protocol version: unspecified
    body.extend(varint::encode(host.len() as u32));
    body.extend(host.as_bytes());
    body.extend(port.to_be_bytes());
    body.push(1); // next state: status

    let mut packet = varint::encode(body.len() as u32);
    packet.extend(body);
    packet.extend([1, 0]); // empty status request, packet id 0
    packet
}

/// Accumulate the response until the declared packet length has arrived in
/// full (or the server closes early, in which case whatever arrived is
/// handed to the parser).
async fn read_response(stream: &mut TcpStream) -> Result<Vec<u8>, StatusError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match varint::decode(&buf) {
            Ok((declared, consumed)) => {
                if buf.len() - consumed >= declared as usize {
                    return Ok(buf);
                }
            }
            Err(VarIntError::Truncated) => {}
            Err(VarIntError::Malformed) => return Err(VarIntError::Malformed.into()),
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(StatusError::ConnectFailed)?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_response(buf: &[u8]) -> Result<ServerStatus, StatusError> {
    let (declared, offset) = varint::decode(buf)?;
    let end = (offset + declared as usize).min(buf.len());
    let frame = &buf[offset..end];

    // The inner packet id and string length are framing artifacts; discard
    // them without validation since some servers frame loosely.
    let (_, id_len) = varint::decode(frame)?;
    let (_, str_len) = varint::decode(&frame[id_len..])?;
    let body = &frame[id_len + str_len..];

    serde_json::from_slice(body).map_err(|e| StatusError::MalformedResponse(e.to_string()))
}
