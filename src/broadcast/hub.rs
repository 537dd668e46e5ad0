//! Local TCP hub that relays broadcast frames between worker processes.
//!
//! Frames are a 4-byte big-endian length followed by a UTF-8 JSON body. The hub
//! re-sends every frame it receives to every connected worker, the sender included;
//! workers drop their own echoes by process id.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::ConnectionManager;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &Value) -> Result<()> {
    let body = serde_json::to_vec(payload).context("Failed to encode hub frame")?;
    if body.len() > MAX_FRAME_BYTES {
        anyhow::bail!("Hub frame of {} bytes exceeds limit", body.len());
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Value>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("Hub frame of {} bytes exceeds limit", len);
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("Hub connection closed mid-frame")?;
    let value = serde_json::from_slice(&body).context("Hub frame is not valid JSON")?;
    Ok(Some(value))
}

/// Backoff after a failed connection: doubles from 2s and stays at 5s.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Binds the hub port on loopback. Returns `None` when another worker already hosts it.
pub async fn try_host_hub(port: u16) -> Result<Option<SocketAddr>> {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::debug!("Hub port {} already taken, joining as client", port);
            return Ok(None);
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to bind hub port {}", port)),
    };
    let addr = listener.local_addr()?;
    tracing::info!("Hosting communication hub on {}", addr);
    tokio::spawn(run_hub(listener));
    Ok(Some(addr))
}

type Peers = Arc<Mutex<HashMap<u64, flume::Sender<Value>>>>;

async fn run_hub(listener: TcpListener) {
    let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
    let next_id = AtomicU64::new(0);
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Hub accept failed: {}", e);
                continue;
            }
        };
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Hub peer {} connected from {}", id, addr);
        tokio::spawn(serve_peer(id, stream, peers.clone()));
    }
}

async fn serve_peer(id: u64, stream: TcpStream, peers: Peers) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, rx) = flume::unbounded::<Value>();
    if let Ok(mut peers) = peers.lock() {
        peers.insert(id, tx);
    }

    let writer_task = tokio::spawn(async move {
        while let Ok(frame) = rx.recv_async().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Hub peer {} write failed: {}", id, e);
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let targets: Vec<flume::Sender<Value>> = match peers.lock() {
                    Ok(peers) => peers.values().cloned().collect(),
                    Err(_) => break,
                };
                for target in targets {
                    let _ = target.send(frame.clone());
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Hub peer {} sent a bad frame: {}", id, e);
                break;
            }
        }
    }

    if let Ok(mut peers) = peers.lock() {
        peers.remove(&id);
    }
    writer_task.abort();
    tracing::debug!("Hub peer {} disconnected", id);
}

/// Keeps this worker attached to the hub, forwarding `outbound` frames to it and
/// handing inbound frames to the connection manager. Never returns.
pub async fn run_hub_client(
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    outbound: flume::Receiver<Value>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::info!("Connected to communication hub at {}", addr);
                backoff = INITIAL_BACKOFF;
                // Frames queued while offline were already delivered locally.
                let stale = outbound.drain().count();
                if stale > 0 {
                    tracing::debug!("Dropped {} frames queued while the hub was down", stale);
                }
                manager.set_hub_connected(true);
                if let Err(e) = pump(stream, &manager, &outbound).await {
                    tracing::warn!("Hub connection lost: {}", e);
                }
                manager.set_hub_connected(false);
            }
            Err(e) => {
                tracing::warn!("Hub at {} unreachable: {}", addr, e);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

async fn pump(
    stream: TcpStream,
    manager: &Arc<ConnectionManager>,
    outbound: &flume::Receiver<Value>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    // Reads are not cancel-safe, so they get their own task instead of a select arm.
    let mut inbound = tokio::spawn(read_loop(reader, manager.clone()));

    let result = loop {
        tokio::select! {
            finished = &mut inbound => {
                break match finished {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("hub reader stopped: {}", e)),
                };
            }
            frame = outbound.recv_async() => {
                let Ok(frame) = frame else {
                    break Err(anyhow::anyhow!("outbound queue closed"));
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    break Err(e);
                }
            }
        }
    };
    inbound.abort();
    result
}

async fn read_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    manager: Arc<ConnectionManager>,
) -> Result<()> {
    while let Some(frame) = read_frame(&mut reader).await? {
        manager.handle_hub_message(frame);
    }
    anyhow::bail!("hub closed the connection")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_carry_a_big_endian_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = json!({"type": "personal", "user_id": 3, "_pid": 42});
        write_frame(&mut a, &payload).await.unwrap();
        drop(a);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        assert_eq!(len, raw.len() - 4);
        let decoded: Value = serde_json::from_slice(&raw[4..]).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn read_frame_handles_close_and_oversized_headers() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let second = next_backoff(INITIAL_BACKOFF);
        assert_eq!(second, Duration::from_secs(4));
        assert_eq!(next_backoff(second), MAX_BACKOFF);
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn hub_fans_frames_out_to_every_peer() {
        let addr = try_host_hub(0).await.unwrap().expect("hub bound");
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        // Let the hub register both peers before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = json!({"type": "discussion_updated", "_pid": 1});
        write_frame(&mut first, &frame).await.unwrap();
        assert_eq!(read_frame(&mut second).await.unwrap(), Some(frame.clone()));
        assert_eq!(read_frame(&mut first).await.unwrap(), Some(frame));

        // A second worker finds the port taken.
        assert!(try_host_hub(addr.port()).await.unwrap().is_none());
    }
}
