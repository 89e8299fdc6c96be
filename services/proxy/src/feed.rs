//! Newline-delimited JSON watch feed.
//!
//! Each line is one [`WatchEvent`]. Lines that fail to parse or decode are
//! logged and skipped; the feed keeps going.

use std::path::Path;

use svcproxy_api::WatchEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::events::ProxyEvent;

/// Counters for one feed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub forwarded: u64,
    pub skipped: u64,
}

/// Open the feed: the file at `path`, or stdin.
pub async fn open_feed(path: Option<&Path>) -> std::io::Result<Box<dyn AsyncBufRead + Send + Unpin>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            info!(path = %path.display(), "Reading watch events from file");
            Ok(Box::new(BufReader::new(file)))
        }
        None => {
            info!("Reading watch events from stdin");
            Ok(Box::new(BufReader::new(tokio::io::stdin())))
        }
    }
}

/// Decode one feed line. Blank lines yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<ProxyEvent>, svcproxy_api::ApiError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = WatchEvent::from_line(line)?;
    Ok(Some(event.decode()?.into()))
}

/// Forward decoded events until end of input, shutdown, or the queue
/// closing.
pub async fn run_feed<R>(
    reader: R,
    tx: mpsc::UnboundedSender<ProxyEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();
    let mut line_no = 0u64;

    loop {
        let line = tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("Watch feed reached end of input");
            break;
        };
        line_no += 1;

        match decode_line(&line) {
            Ok(Some(event)) => {
                if tx.send(event).is_err() {
                    debug!("Event queue closed, stopping feed");
                    break;
                }
                stats.forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => {
                stats.skipped += 1;
                warn!(line = line_no, error = %e, "Skipping malformed watch event");
            }
        }
    }

    info!(
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        "Watch feed stopped"
    );
    Ok(stats)
}
