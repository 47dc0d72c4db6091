//! BaseStation TCP feed: connect, read lines, decode, forward.
//!
//! The connection is retried forever with capped exponential backoff. Each
//! line is decoded on its own task, so reports for one aircraft can reach the
//! dispatcher slightly out of order.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use sbs_core::sbs::decode_line;
use sbs_core::types::*;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// `host:port` of the BaseStation output.
    pub addr: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl FeedConfig {
    pub fn new(addr: impl Into<String>, max_backoff: Duration) -> Self {
        FeedConfig {
            addr: addr.into(),
            initial_backoff: Duration::from_millis(100),
            max_backoff,
        }
    }
}

/// Doubling retry delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            next: initial.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

/// Keep a session to `config.addr` open until the report queue closes.
pub async fn run(config: FeedConfig, reports: mpsc::Sender<TrackingReport>) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);

    while !reports.is_closed() {
        match TcpStream::connect(&config.addr).await {
            Ok(stream) => {
                info!("connected to feed at {}", config.addr);
                backoff.reset();
                match read_lines(stream, &reports).await {
                    Ok(lines) => info!("feed closed by {} after {lines} lines", config.addr),
                    Err(e) => warn!("feed read from {} failed: {e}", config.addr),
                }
            }
            Err(e) => warn!("cannot connect to feed at {}: {e}", config.addr),
        }

        if reports.is_closed() {
            break;
        }
        let delay = backoff.next_delay();
        info!("reconnecting to {} in {delay:?}", config.addr);
        sleep(delay).await;
    }

    debug!("report queue closed, feed stopped");
}

/// Read newline-terminated records until EOF, spawning a decode task per line.
/// Returns the number of lines read.
pub async fn read_lines<R>(reader: R, reports: &mpsc::Sender<TrackingReport>) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(lines);
        }
        // Tolerate the odd non-UTF-8 byte instead of dropping the session.
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        lines += 1;
        trace!(line = %line, "received");

        let tx = reports.clone();
        tokio::spawn(async move {
            if let Some(report) = decode_logged(&line) {
                // Closed queue means shutdown; the report is dropped.
                let _ = tx.send(report).await;
            }
        });

        if reports.is_closed() {
            return Ok(lines);
        }
    }
}

/// Decode one line, logging why it was discarded.
pub fn decode_logged(line: &str) -> Option<TrackingReport> {
    match decode_line(line) {
        Ok(report) => {
            debug!(icao = %icao_to_string(&report.icao), subtype = report.subtype, "decoded");
            Some(report)
        }
        Err(e) if e.is_routine() => {
            debug!("skipping line: {e}");
            None
        }
        Err(e) => {
            warn!("discarding malformed line {line:?}: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
