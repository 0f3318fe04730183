use serde::Deserialize;

const FRAME_MARKER: &str = "data: ";

/// JSON envelope carried by each stream frame.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

/// Incremental decoder for the push-event log stream.
///
/// Bytes arrive in arbitrary network chunks; only complete
/// newline-terminated segments are decoded, and a trailing partial segment
/// is carried over to the next chunk so a frame that straddles two chunks
/// reassembles correctly. The decoder is not restartable: a dropped
/// connection ends the sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one delivery and return the log lines it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let segment: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&segment[..segment.len() - 1]);
            if let Some(decoded) = decode_frame(line.trim_end_matches('\r')) {
                lines.push(decoded);
            }
        }
        lines
    }
}

/// Decode one complete line into at most one log line.
///
/// Lines without the frame marker (blank separators, comments) are
/// skipped. A marked payload is tried as a JSON envelope: `type == "log"`
/// with a non-empty message yields that message; other envelope types are
/// ignored for forward compatibility; anything unparseable is passed
/// through verbatim rather than dropped.
fn decode_frame(line: &str) -> Option<String> {
    let payload = line.strip_prefix(FRAME_MARKER)?;
    match serde_json::from_str::<Envelope>(payload) {
        Ok(env) if env.kind == "log" => env.message.filter(|m| !m.is_empty()),
        Ok(_) => None,
        Err(_) => Some(payload.to_string()),
    }
}
