use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::limits::MAX_FEED_LINE_LEN;

use super::{IngestError, RawLog};

/// A push subscription to payment logs.
#[async_trait]
pub trait PaymentFeed: Send {
    /// Next item, or `None` once the subscription has ended. An `Err` is one
    /// bad item; the feed stays usable.
    async fn next_log(&mut self) -> Option<Result<RawLog, IngestError>>;
}

/// Line codec that reports an oversized line as an item instead of a stream
/// error, so the frame reader keeps going after it.
struct LogLines(LinesCodec);

impl LogLines {
    fn lift(
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> io::Result<Option<Result<String, IngestError>>> {
        match decoded {
            Ok(line) => Ok(line.map(Ok)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(IngestError::LineTooLong))),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LogLines {
    type Item = Result<String, IngestError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        Self::lift(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        Self::lift(self.0.decode_eof(src))
    }
}

/// Newline-delimited JSON logs over any byte stream, e.g. a TCP connection
/// to a chain relay.
pub struct LineFeed<R> {
    lines: FramedRead<R, LogLines>,
}

impl<R: AsyncRead + Unpin + Send> LineFeed<R> {
    pub fn new(reader: R) -> Self {
        let codec = LogLines(LinesCodec::new_with_max_length(MAX_FEED_LINE_LEN));
        Self {
            lines: FramedRead::new(reader, codec),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PaymentFeed for LineFeed<R> {
    async fn next_log(&mut self) -> Option<Result<RawLog, IngestError>> {
        loop {
            let line = match self.lines.next().await? {
                Ok(Ok(line)) => line,
                Ok(Err(e)) => return Some(Err(e)),
                Err(e) => {
                    warn!("payment feed read failed: {e}");
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| IngestError::Json(e.to_string())));
        }
    }
}

/// In-process feed, for embedding the reconciler behind another transport.
pub struct ChannelFeed {
    rx: mpsc::Receiver<RawLog>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> (mpsc::Sender<RawLog>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl PaymentFeed for ChannelFeed {
    async fn next_log(&mut self) -> Option<Result<RawLog, IngestError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_line(topic: &str) -> String {
        format!("{{\"topics\":[\"{topic}\"],\"data\":\"0x\"}}\n")
    }

    #[tokio::test]
    async fn bad_line_does_not_end_the_feed() {
        let first = log_line("0x01");
        let last = log_line("0x02");
        let reader = tokio_test::io::Builder::new()
            .read(first.as_bytes())
            .read(b"{not json}\n\n")
            .read(last.as_bytes())
            .build();
        let mut feed = LineFeed::new(reader);

        assert_eq!(feed.next_log().await.unwrap().unwrap().topics, vec!["0x01"]);
        assert!(matches!(feed.next_log().await, Some(Err(IngestError::Json(_)))));
        assert_eq!(feed.next_log().await.unwrap().unwrap().topics, vec!["0x02"]);
        assert!(feed.next_log().await.is_none());
    }

    #[tokio::test]
    async fn oversized_line_is_reported_and_skipped() {
        let huge = format!("{}\n", "x".repeat(MAX_FEED_LINE_LEN + 10));
        let after = log_line("0x03");
        let reader = tokio_test::io::Builder::new()
            .read(huge.as_bytes())
            .read(after.as_bytes())
            .build();
        let mut feed = LineFeed::new(reader);

        assert!(matches!(feed.next_log().await, Some(Err(IngestError::LineTooLong))));
        assert_eq!(feed.next_log().await.unwrap().unwrap().topics, vec!["0x03"]);
    }

    #[tokio::test]
    async fn channel_feed_ends_when_sender_drops() {
        let (tx, mut feed) = ChannelFeed::new(4);
        tx.send(RawLog { address: None, topics: vec![], data: String::new() })
            .await
            .unwrap();
        drop(tx);
        assert!(feed.next_log().await.unwrap().is_ok());
        assert!(feed.next_log().await.is_none());
    }
}
