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

//! Incremental framing of one HTTP message out of partial reads.
//!
//! The assembler only determines where a message ends: the method token,
//! the offset of the blank line ending the head, and the declared body
//! length. Full head parsing happens later, on a worker thread, via
//! [`Request::parse`](super::request::Request::parse).

use super::Method;
use std::str;
use std::time::Instant;

pub const HEADER_END: &[u8] = b"\r\n\r\n";

const METHOD_LEN_MAX: usize = 32;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum AssembleError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("request too large")]
    TooLarge,
}

fn find_forward(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_backward(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

// scans header lines between the request line and the terminator for a
// content-length value
fn content_length(head: &[u8]) -> Result<Option<usize>, AssembleError> {
    let mut lines = head.split(|b| *b == b'\n');

    // request line
    lines.next();

    for line in lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let pos = match line.iter().position(|b| *b == b':') {
            Some(pos) => pos,
            None => continue,
        };

        let name = &line[..pos];

        if !name.eq_ignore_ascii_case(b"content-length") {
            continue;
        }

        let value = str::from_utf8(&line[(pos + 1)..])
            .map_err(|_| AssembleError::InvalidContentLength)?
            .trim();

        return match value.parse::<usize>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => Err(AssembleError::InvalidContentLength),
        };
    }

    Ok(None)
}

pub struct RequestAssembler {
    buf: Vec<u8>,
    method: Option<Method>,
    header_end: Option<usize>,
    declared: usize,
    size_max: usize,
    created: Instant,
}

impl RequestAssembler {
    pub fn new(size_max: usize) -> Self {
        Self {
            buf: Vec::new(),
            method: None,
            header_end: None,
            declared: 0,
            size_max,
            created: Instant::now(),
        }
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    // offset of the blank line ending the head, once seen
    pub fn header_end(&self) -> Option<usize> {
        self.header_end
    }

    pub fn declared_body_len(&self) -> usize {
        self.declared
    }

    // total size of the message, once the head is known
    pub fn expected_len(&self) -> Option<usize> {
        self.header_end
            .map(|end| end + HEADER_END.len() + self.declared)
    }

    pub fn is_complete(&self) -> bool {
        match self.expected_len() {
            Some(expected) => self.buf.len() >= expected,
            None => false,
        }
    }

    // append newly read bytes. returns true once a full message is present
    pub fn add(&mut self, data: &[u8]) -> Result<bool, AssembleError> {
        let prev_len = self.buf.len();

        self.buf.extend_from_slice(data);

        if self.method.is_none() {
            let search = &self.buf[..self.buf.len().min(METHOD_LEN_MAX + 1)];

            match search.iter().position(|b| *b == b' ') {
                Some(0) => return Err(AssembleError::BadRequestLine),
                Some(pos) => self.method = Some(Method::from_token(&self.buf[..pos])),
                None => {
                    if self.buf.len() > METHOD_LEN_MAX {
                        return Err(AssembleError::BadRequestLine);
                    }

                    return Ok(false);
                }
            }
        }

        let method = match self.method {
            Some(m) => m,
            None => return Ok(false),
        };

        if self.header_end.is_none() {
            // the terminator may straddle the previous read
            let start = prev_len.saturating_sub(HEADER_END.len() - 1);
            let region = &self.buf[start..];

            let found = if method.has_body() {
                // a body may follow the head in the same read, so the
                // terminator is expected near the front of the new bytes
                find_forward(region, HEADER_END)
            } else {
                // header-only messages end with the terminator, so look
                // from the tail first. pipelined messages may follow it,
                // in which case the earliest occurrence is the real one
                find_backward(region, HEADER_END).map(|pos| {
                    find_forward(&region[..(pos + HEADER_END.len())], HEADER_END).unwrap_or(pos)
                })
            };

            if let Some(pos) = found {
                let end = start + pos;

                self.declared = if method.has_body() {
                    content_length(&self.buf[..end])?.unwrap_or(0)
                } else {
                    0
                };

                self.header_end = Some(end);
            }
        }

        let limit = match self.expected_len() {
            Some(expected) => expected,
            None => self.buf.len(),
        };

        if limit > self.size_max {
            return Err(AssembleError::TooLarge);
        }

        Ok(self.is_complete())
    }

    // split a complete message from any bytes that followed it
    pub fn finish(mut self) -> (Vec<u8>, Vec<u8>) {
        let expected = self.expected_len().unwrap_or(self.buf.len());
        let expected = expected.min(self.buf.len());

        let surplus = self.buf.split_off(expected);

        (self.buf, surplus)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE_MAX: usize = 1_000_000;

    fn assemble_in_pieces(data: &[u8], piece: usize) -> (RequestAssembler, Vec<bool>) {
        let mut a = RequestAssembler::new(SIZE_MAX);
        let mut results = Vec::new();

        for chunk in data.chunks(piece) {
            results.push(a.add(chunk).unwrap());
        }

        (a, results)
    }

    #[test]
    fn get_complete_exactly() {
        let data = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(&data[..(data.len() - 1)]).unwrap(), false);
        assert_eq!(a.add(&data[(data.len() - 1)..]).unwrap(), true);

        assert_eq!(a.method(), Some(Method::Get));
        assert_eq!(a.header_end(), Some(data.len() - 4));
        assert_eq!(a.declared_body_len(), 0);
        assert_eq!(a.expected_len(), Some(data.len()));
    }

    #[test]
    fn post_waits_for_body() {
        let head = b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\n";

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(head).unwrap(), false);
        assert_eq!(a.declared_body_len(), 5);

        assert_eq!(a.add(b"hell").unwrap(), false);
        assert_eq!(a.add(b"o").unwrap(), true);

        let (msg, surplus) = a.finish();
        assert_eq!(msg.len(), head.len() + 5);
        assert!(surplus.is_empty());
    }

    #[test]
    fn bodyless_ignores_content_length() {
        let data = b"GET / HTTP/1.1\r\nContent-Length: 10\r\n\r\n";

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(data).unwrap(), true);
        assert_eq!(a.declared_body_len(), 0);
    }

    #[test]
    fn post_without_length_has_empty_body() {
        let data = b"POST /x HTTP/1.1\r\nHost: h\r\n\r\n";

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(data).unwrap(), true);
        assert_eq!(a.declared_body_len(), 0);
    }

    #[test]
    fn fragmentation_does_not_matter() {
        let messages: [&[u8]; 3] = [
            b"GET /x?a=1 HTTP/1.1\r\nHost: h\r\nCookie: a=b\r\n\r\n",
            b"POST /p HTTP/1.1\r\ncontent-length: 11\r\n\r\nhello world",
            b"PUT /u HTTP/1.0\r\nContent-Length:3\r\nX: y\r\n\r\nabc",
        ];

        for data in messages {
            let mut whole = RequestAssembler::new(SIZE_MAX);
            assert_eq!(whole.add(data).unwrap(), true);

            for piece in 1..data.len() {
                let (a, results) = assemble_in_pieces(data, piece);

                // complete only on the final piece
                assert_eq!(results.last(), Some(&true), "piece size {}", piece);
                assert!(results[..(results.len() - 1)].iter().all(|r| !r));

                assert_eq!(a.method(), whole.method());
                assert_eq!(a.header_end(), whole.header_end());
                assert_eq!(a.declared_body_len(), whole.declared_body_len());
                assert_eq!(a.as_bytes(), whole.as_bytes());
            }
        }
    }

    #[test]
    fn pipelined_surplus() {
        let data = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(data).unwrap(), true);
        assert_eq!(a.header_end(), Some(15));

        let (msg, surplus) = a.finish();
        assert_eq!(msg, b"GET /a HTTP/1.1\r\n\r\n");
        assert_eq!(surplus, b"GET /b HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn response_framing() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(&data[..20]).unwrap(), false);
        assert_eq!(a.add(&data[20..]).unwrap(), true);
        assert_eq!(a.method(), Some(Method::Other));
    }

    #[test]
    fn errors() {
        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(
            a.add(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n"),
            Err(AssembleError::InvalidContentLength)
        );

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(a.add(b" / HTTP/1.1"), Err(AssembleError::BadRequestLine));

        let mut a = RequestAssembler::new(SIZE_MAX);
        assert_eq!(
            a.add(&[b'A'; METHOD_LEN_MAX + 1]),
            Err(AssembleError::BadRequestLine)
        );

        let mut a = RequestAssembler::new(64);
        assert_eq!(
            a.add(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n"),
            Err(AssembleError::TooLarge)
        );
    }
}
