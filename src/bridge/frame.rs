/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Bridge frame layout, big-endian:
//!
//! ```text
//! [8 bytes: i64 id][4 bytes: i32 continuation][4 bytes: i32 length][payload]
//! ```
//!
//! A negative continuation marks a self-contained frame, or the last frame
//! of a message. Larger payloads are split into fragments whose continuation
//! is their index, all sharing the id of the message.

use crate::core::buffer::FrameBuffer;
use arrayvec::ArrayVec;
use std::collections::HashMap;

// 8 bytes id + 4 bytes continuation + 4 bytes length
pub const HEADER_SIZE: usize = 16;

pub const FRAGMENT_SIZE_MAX: usize = 1_048_576;

// reject corrupt length fields rather than buffer forever
pub const MESSAGE_SIZE_MAX: usize = 64 * FRAGMENT_SIZE_MAX;

pub const SELF_CONTAINED: i32 = -1;

const DECODE_BUFFER_SIZE: usize = 16_384;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("negative frame length {0}")]
    NegativeLength(i32),

    #[error("frame or message too large: {0} bytes")]
    TooLarge(usize),

    #[error("fragment {got} of message {id} out of order, expected {expected}")]
    OutOfOrder { id: i64, expected: i32, got: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub id: i64,
    pub continuation: i32,
    pub length: i32,
}

impl FrameHeader {
    pub fn is_final(&self) -> bool {
        self.continuation < 0
    }
}

pub fn write_header(h: &FrameHeader) -> ArrayVec<u8, HEADER_SIZE> {
    let mut out = ArrayVec::new();

    out.try_extend_from_slice(&h.id.to_be_bytes()).unwrap();
    out.try_extend_from_slice(&h.continuation.to_be_bytes()).unwrap();
    out.try_extend_from_slice(&h.length.to_be_bytes()).unwrap();

    out
}

// None if fewer than HEADER_SIZE bytes are available
pub fn read_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let mut id = [0; 8];
    id.copy_from_slice(&buf[0..8]);

    let mut continuation = [0; 4];
    continuation.copy_from_slice(&buf[8..12]);

    let mut length = [0; 4];
    length.copy_from_slice(&buf[12..16]);

    Some(FrameHeader {
        id: i64::from_be_bytes(id),
        continuation: i32::from_be_bytes(continuation),
        length: i32::from_be_bytes(length),
    })
}

// append the frames carrying one message
pub fn encode_message(id: i64, payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    if payload.len() > MESSAGE_SIZE_MAX {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let count = payload.len().div_ceil(FRAGMENT_SIZE_MAX).max(1);

    out.reserve(payload.len() + (count * HEADER_SIZE));

    for index in 0..count {
        let start = index * FRAGMENT_SIZE_MAX;
        let end = (start + FRAGMENT_SIZE_MAX).min(payload.len());

        let chunk = &payload[start..end];

        let continuation = if index == count - 1 {
            SELF_CONTAINED
        } else {
            index as i32
        };

        let h = FrameHeader {
            id,
            continuation,
            length: chunk.len() as i32,
        };

        out.extend_from_slice(&write_header(&h));
        out.extend_from_slice(chunk);
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
pub struct Message {
    pub id: i64,
    pub payload: Vec<u8>,
}

struct Partial {
    next: i32,
    data: Vec<u8>,
}

// accumulates received bytes and yields complete messages
pub struct FrameDecoder {
    buf: FrameBuffer,
    partials: HashMap<i64, Partial>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: FrameBuffer::new(DECODE_BUFFER_SIZE),
            partials: HashMap::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.append(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.read_avail()
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            let src = self.buf.read_buf();

            let h = match read_header(src) {
                Some(h) => h,
                None => return Ok(None),
            };

            if h.length < 0 {
                return Err(FrameError::NegativeLength(h.length));
            }

            let len = h.length as usize;

            if len > FRAGMENT_SIZE_MAX {
                return Err(FrameError::TooLarge(len));
            }

            if src.len() < HEADER_SIZE + len {
                return Ok(None);
            }

            let chunk = src[HEADER_SIZE..(HEADER_SIZE + len)].to_vec();
            self.buf.read_commit(HEADER_SIZE + len);

            if !h.is_final() {
                let p = self.partials.entry(h.id).or_insert(Partial {
                    next: 0,
                    data: Vec::new(),
                });

                if h.continuation != p.next {
                    let expected = p.next;
                    self.partials.remove(&h.id);

                    return Err(FrameError::OutOfOrder {
                        id: h.id,
                        expected,
                        got: h.continuation,
                    });
                }

                p.next += 1;
                p.data.extend_from_slice(&chunk);

                if p.data.len() > MESSAGE_SIZE_MAX {
                    let size = p.data.len();
                    self.partials.remove(&h.id);

                    return Err(FrameError::TooLarge(size));
                }

                continue;
            }

            let payload = match self.partials.remove(&h.id) {
                Some(mut p) => {
                    p.data.extend_from_slice(&chunk);

                    if p.data.len() > MESSAGE_SIZE_MAX {
                        return Err(FrameError::TooLarge(p.data.len()));
                    }

                    p.data
                }
                None => chunk,
            };

            return Ok(Some(Message { id: h.id, payload }));
        }
    }
}
