//! Bounded output capture

use tokio::io::{AsyncRead, AsyncReadExt};

/// Appended on its own line when a stream was cut at its cap
pub const TRUNCATION_MARKER: &str = "[output truncated]";

const CHUNK_SIZE: usize = 8192;

/// Bytes kept from one output stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    pub fn new(bytes: impl Into<Vec<u8>>, truncated: bool) -> Self {
        Self {
            bytes: bytes.into(),
            truncated,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the stream produced more than the cap
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && !self.truncated
    }

    /// Lossy UTF-8 text, with the truncation marker if anything was dropped
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Read a stream to its end, keeping at most `cap` bytes.
///
/// Everything past the cap is drained and discarded so the writer never
/// blocks on a full pipe.
pub async fn read_capped<R>(reader: Option<R>, cap: Option<usize>) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Captured::default());
    };

    let mut bytes = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let keep = match cap {
            Some(cap) => cap.saturating_sub(bytes.len()).min(n),
            None => n,
        };
        bytes.extend_from_slice(&chunk[..keep]);
        truncated |= keep < n;
    }

    Ok(Captured { bytes, truncated })
}
