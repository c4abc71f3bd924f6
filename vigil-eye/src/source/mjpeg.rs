//! MJPEG framing over a raw HTTP body
//!
//! Multipart headers and boundaries are never parsed: every image is
//! located by its JPEG start-of-image and end-of-image markers.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on bytes buffered while looking for a complete image
const MAX_BUFFERED: usize = 8 * 1024 * 1024;

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Incremental splitter turning body chunks into JPEG payloads
#[derive(Debug, Default)]
pub struct MjpegSplitter {
    buffer: Vec<u8>,
    overflows: u32,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFERED {
            // No complete image in 8 MiB: drop everything but a possible
            // half marker at the tail.
            let keep = self.buffer.split_off(self.buffer.len() - 1);
            self.buffer = keep;
            self.overflows += 1;
        }
    }

    /// Overflow events since the last call
    pub fn take_overflows(&mut self) -> u32 {
        std::mem::take(&mut self.overflows)
    }

    /// Next complete JPEG, if one is buffered
    pub fn next_image(&mut self) -> Option<Vec<u8>> {
        let start = match find_marker(&self.buffer, SOI) {
            Some(start) => start,
            None => {
                // Keep a trailing 0xFF in case the marker straddles chunks
                let tail = if self.buffer.last() == Some(&0xFF) { 1 } else { 0 };
                let drop = self.buffer.len() - tail;
                self.buffer.drain(..drop);
                return None;
            }
        };

        let end = find_marker(&self.buffer[start + 2..], EOI)? + start + 2;
        let image = self.buffer[start..end + 2].to_vec();
        self.buffer.drain(..end + 2);
        Some(image)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
