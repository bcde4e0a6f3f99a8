//! Splitting message bodies into content body frames and collecting them back.
use crate::codec::FRAME_OVERHEAD;
use crate::frame::{Channel, ContentBodyFrame, ContentHeaderFrame};
use crate::{frame_error, Result, UNEXPECTED_FRAME};

/// Split `body` into body frames which fit into `frame_max`. A `frame_max` of 0 means there is
/// no limit, so the body goes in one frame. An empty body produces no frames.
pub fn split_body(channel: Channel, body: &[u8], frame_max: u32) -> Vec<ContentBodyFrame> {
    let chunk_size = if frame_max as usize > FRAME_OVERHEAD {
        frame_max as usize - FRAME_OVERHEAD
    } else {
        body.len().max(1)
    };

    body.chunks(chunk_size)
        .map(|chunk| ContentBodyFrame {
            channel,
            body: chunk.to_vec(),
        })
        .collect()
}

/// Collects a content header and the following body frames into one message body.
#[derive(Debug)]
pub struct ContentCollector {
    header: ContentHeaderFrame,
    body: Vec<u8>,
}

impl ContentCollector {
    pub fn new(header: ContentHeaderFrame) -> Self {
        let capacity = std::cmp::min(header.body_size, 1 << 20) as usize;

        Self {
            header,
            body: Vec::with_capacity(capacity),
        }
    }

    pub fn header(&self) -> &ContentHeaderFrame {
        &self.header
    }

    /// Append a body frame. Returns an error if the body grows over the size in the header.
    pub fn push(&mut self, frame: ContentBodyFrame) -> Result<()> {
        if (self.body.len() + frame.body.len()) as u64 > self.header.body_size {
            return frame_error!(
                UNEXPECTED_FRAME,
                format!(
                    "Content body is longer than the announced {} bytes",
                    self.header.body_size
                )
            );
        }

        self.body.extend_from_slice(&frame.body);

        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.body.len() as u64 == self.header.body_size
    }

    /// Give back the header and the body collected so far.
    pub fn finish(self) -> (ContentHeaderFrame, Vec<u8>) {
        (self.header, self.body)
    }
}
