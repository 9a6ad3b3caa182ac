//! Ingestion: batch encoders and the carbon TCP sender.
//!
//! Two wire forms are supported:
//!
//! - text: `"<name> <value> <timestamp>\n"` per point
//! - binary framed: a 4-byte big-endian length, then a protobuf3
//!   `Payload { repeated Metric metrics = 1; }` with
//!   `Metric { string metric = 1; repeated Point points = 2; }` and
//!   `Point { uint32 timestamp = 1; double value = 2; }`

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::SenderConfig;
use crate::error::{Result, TransportError};
use crate::model::{Metric, Point};
use crate::store::MetricSink;

/// Turns a batch into bytes for one transport write.
pub trait Encoder: Send + Sync {
    fn encode(&self, batch: &[Metric]) -> Result<Vec<u8>>;

    fn content_type(&self) -> &'static str;
}

/// Which encoder a sender uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Text,
    BinaryFramed,
}

impl Encoding {
    #[must_use]
    pub fn encoder(self) -> Box<dyn Encoder> {
        match self {
            Self::Text => Box::new(TextEncoder),
            Self::BinaryFramed => Box::new(FramedEncoder),
        }
    }
}

/// Plaintext carbon line protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextEncoder;

impl Encoder for TextEncoder {
    fn encode(&self, batch: &[Metric]) -> Result<Vec<u8>> {
        let mut out = String::new();
        for metric in batch {
            for p in &metric.points {
                // infallible for String
                let _ = writeln!(out, "{} {} {}", metric.name, p.value, p.timestamp);
            }
        }
        Ok(out.into_bytes())
    }

    fn content_type(&self) -> &'static str {
        "text/plain"
    }
}

/// Length-prefixed carbon protobuf payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedEncoder;

impl Encoder for FramedEncoder {
    fn encode(&self, batch: &[Metric]) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        for metric in batch {
            let body = encode_metric(metric);
            put_len_delimited(&mut payload, 1, &body);
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            TransportError::Encode(format!("payload of {} bytes exceeds frame limit", payload.len()))
        })?;

        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn content_type(&self) -> &'static str {
        "application/protobuf"
    }
}

fn encode_metric(metric: &Metric) -> Vec<u8> {
    let mut out = Vec::new();
    if !metric.name.is_empty() {
        put_len_delimited(&mut out, 1, metric.name.as_bytes());
    }
    for p in &metric.points {
        put_len_delimited(&mut out, 2, &encode_point(p));
    }
    out
}

// proto3 leaves default-valued scalars off the wire
fn encode_point(p: &Point) -> Vec<u8> {
    let mut out = Vec::with_capacity(15);
    if p.timestamp != 0 {
        put_varint(&mut out, 1 << 3);
        put_varint(&mut out, u64::from(p.timestamp));
    }
    if p.value.to_bits() != 0 {
        put_varint(&mut out, (2 << 3) | 1);
        out.extend_from_slice(&p.value.to_le_bytes());
    }
    out
}

fn put_len_delimited(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    put_varint(out, (field << 3) | 2);
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Sends each batch over a fresh TCP connection. No retry: a failed
/// connect or write is returned to the caller.
pub struct TcpSender {
    address: String,
    timeout: Duration,
    encoder: Box<dyn Encoder>,
}

impl std::fmt::Debug for TcpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSender")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .field("content_type", &self.encoder.content_type())
            .finish()
    }
}

impl TcpSender {
    pub fn new(address: impl Into<String>, timeout: Duration, encoding: Encoding) -> Self {
        Self::with_encoder(address, timeout, encoding.encoder())
    }

    pub fn with_encoder(
        address: impl Into<String>,
        timeout: Duration,
        encoder: Box<dyn Encoder>,
    ) -> Self {
        Self {
            address: address.into(),
            timeout,
            encoder,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &SenderConfig) -> Self {
        Self::new(cfg.address.clone(), cfg.timeout(), cfg.encoding)
    }

    fn timeout_error(&self, operation: &'static str) -> TransportError {
        TransportError::Timeout {
            operation,
            address: self.address.clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl MetricSink for TcpSender {
    async fn send(&self, metrics: &[Metric]) -> Result<()> {
        let points: usize = metrics.iter().map(|m| m.points.len()).sum();
        if points == 0 {
            return Ok(());
        }
        let bytes = self.encoder.encode(metrics)?;

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.timeout_error("connect"))?
            .map_err(|source| TransportError::Connect {
                address: self.address.clone(),
                source,
            })?;

        tokio::time::timeout(self.timeout, async {
            stream.write_all(&bytes).await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| self.timeout_error("send"))?
        .map_err(|source| TransportError::Send {
            address: self.address.clone(),
            source,
        })?;

        debug!(
            address = %self.address,
            metrics = metrics.len(),
            points,
            bytes = bytes.len(),
            content_type = self.encoder.content_type(),
            "Sent batch"
        );
        Ok(())
    }
}
