use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::api::ExperimentApi;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::ExperimentId;
use crate::stream::{FrameDecoder, LogBuffer};

/// Owns one cancellable log stream connection for a running experiment and
/// drains it into the bounded buffer. Open failures and mid-stream errors
/// are swallowed here: the stream is best-effort and must never fail the
/// run it narrates.
pub struct LogStreamConsumer {
    token: CancellationToken,
}

impl LogStreamConsumer {
    pub fn spawn(
        api: Arc<dyn ExperimentApi>,
        id: ExperimentId,
        buffer: Arc<Mutex<LogBuffer>>,
        token: CancellationToken,
    ) -> Self {
        tokio::spawn(read_loop(api, id, buffer, token.clone()));
        Self { token }
    }

    /// Cancel the connection. Idempotent; frames still in flight are
    /// discarded, not appended.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

async fn read_loop(
    api: Arc<dyn ExperimentApi>,
    id: ExperimentId,
    buffer: Arc<Mutex<LogBuffer>>,
    token: CancellationToken,
) {
    let mut stream = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        opened = api.open_log_stream(id) => match opened {
            Ok(stream) => stream,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Stream,
                    "open_failed",
                    obj(&[("experiment", v_str(id.as_str())), ("error", v_str(&format!("{:#}", err)))]),
                );
                return;
            }
        },
    };
    log(
        Level::Debug,
        Domain::Stream,
        "connected",
        obj(&[("experiment", v_str(id.as_str()))]),
    );

    let mut decoder = FrameDecoder::new();
    loop {
        let delivery = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            item = stream.next() => item,
        };
        // Re-check per delivery: a chunk that was already in flight when
        // the token fired must not be decoded or appended.
        if token.is_cancelled() {
            return;
        }
        match delivery {
            Some(Ok(chunk)) => {
                let lines = decoder.feed(&chunk);
                if lines.is_empty() {
                    continue;
                }
                if let Ok(mut buf) = buffer.lock() {
                    for line in lines {
                        buf.push(line);
                    }
                }
            }
            Some(Err(err)) => {
                // Mid-stream failure is non-fatal to the runner; the next
                // run opens a fresh connection. No automatic reconnect.
                log(
                    Level::Warn,
                    Domain::Stream,
                    "read_error",
                    obj(&[("experiment", v_str(id.as_str())), ("error", v_str(&format!("{:#}", err)))]),
                );
                return;
            }
            None => {
                log(
                    Level::Debug,
                    Domain::Stream,
                    "closed",
                    obj(&[("experiment", v_str(id.as_str()))]),
                );
                return;
            }
        }
    }
}
