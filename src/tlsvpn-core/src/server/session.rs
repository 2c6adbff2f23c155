//! Per-client session state.
//!
//! A session owns the write half of one TLS stream plus the per-peer
//! counters. The read half lives in the session's receive loop. Sends take
//! a sequence number under the counter lock, then serialize at the writer
//! lock; byte counters are plain atomics. `close()` is idempotent and safe
//! to race with the receive loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::server::TlsStream;

use crate::protocol::{Message, RecvSequence, SequenceCounter};

pub type SessionWriter = WriteHalf<TlsStream<TcpStream>>;

/// One accepted client connection and its state.
pub struct Session {
    pub id: String,
    pub remote_addr: SocketAddr,
    pub assigned_ip: Ipv4Addr,
    pub cert_common_name: String,
    pub connected_at: SystemTime,

    writer: Mutex<SessionWriter>,
    send_seq: SequenceCounter,
    pub recv_seq: RecvSequence,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed: AtomicBool,
    last_activity: StdMutex<Instant>,
}

impl Session {
    pub fn new(
        id: String,
        remote_addr: SocketAddr,
        writer: SessionWriter,
        assigned_ip: Ipv4Addr,
        cert_common_name: String,
    ) -> Self {
        Self {
            id,
            remote_addr,
            assigned_ip,
            cert_common_name,
            connected_at: SystemTime::now(),
            writer: Mutex::new(writer),
            send_seq: SequenceCounter::new(),
            recv_seq: RecvSequence::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    /// Send one Data frame (sequence from the counter, CRC over payload).
    pub async fn send_data(&self, payload: &[u8]) -> Result<()> {
        let seq = self.send_seq.next();
        let msg = Message::data(seq, payload.to_vec());
        self.write(&msg).await?;
        self.bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send a heartbeat reply (sequence 0, no payload).
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.write(&Message::heartbeat()).await
    }

    /// Send a Control frame carrying JSON.
    pub async fn send_control(&self, json: Vec<u8>) -> Result<()> {
        let seq = self.send_seq.next();
        let msg = Message::control(seq, json);
        self.write(&msg).await
    }

    /// Send the initial IpAssignment frame (sequence 0, 4-byte payload).
    pub async fn send_ip_assignment(&self) -> Result<()> {
        self.write(&Message::ip_assignment(self.assigned_ip)).await
    }

    async fn write(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            bail!("session {} is closed", self.id);
        }
        let encoded = msg.encode();
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&encoded)
            .await
            .with_context(|| format!("writing to session {}", self.id))?;
        writer
            .flush()
            .await
            .with_context(|| format!("flushing session {}", self.id))?;
        Ok(())
    }

    /// Idempotent close: first caller shuts the TLS stream down, later
    /// callers and racing loops see the flag.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// (bytes_sent, bytes_received)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }

    pub fn info(&self) -> SessionInfo {
        let (sent, received) = self.stats();
        let connected_at = chrono::DateTime::<chrono::Utc>::from(self.connected_at);
        let duration = SystemTime::now()
            .duration_since(self.connected_at)
            .unwrap_or_default();
        SessionInfo {
            ip: self.assigned_ip.to_string(),
            bytes_sent: sent,
            bytes_received: received,
            connected_at: connected_at.to_rfc3339(),
            duration: format!("{}s", duration.as_secs()),
        }
    }
}

/// Wire shape of one entry in `server/clients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub ip: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connected_at: String,
    pub duration: String,
}
