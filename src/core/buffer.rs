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

use std::cmp;
use std::io;
use std::io::{Read, Write};

pub const FRAME_BUFFER_SIZE_MIN: usize = 64;

// a linear byte buffer with separate read and write cursors. capacity only
// ever increases, by doubling, and growth keeps every unread byte at the
// same offset relative to the read cursor
pub struct FrameBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl FrameBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; cmp::max(size, FRAME_BUFFER_SIZE_MIN)],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    pub fn read_avail(&self) -> usize {
        self.end - self.start
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(self.start + amount <= self.end);

        self.start += amount;

        if self.start == self.end {
            self.clear();
        }
    }

    pub fn write_avail(&self) -> usize {
        self.buf.len() - self.end
    }

    pub fn write_buf(&mut self) -> &mut [u8] {
        let len = self.buf.len();

        &mut self.buf[self.end..len]
    }

    pub fn write_commit(&mut self, amount: usize) {
        assert!(self.end + amount <= self.buf.len());

        self.end += amount;
    }

    // move unread bytes to the front so the whole tail is writable
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }

        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    // double the capacity. returns the new capacity
    pub fn grow(&mut self) -> usize {
        self.compact();

        let size = self.buf.len() * 2;
        self.buf.resize(size, 0);

        size
    }

    // make room for at least amount more bytes, doubling as many times as
    // needed. compaction is tried first
    pub fn reserve(&mut self, amount: usize) {
        if self.write_avail() >= amount {
            return;
        }

        self.compact();

        while self.write_avail() < amount {
            self.grow();
        }
    }

    pub fn append(&mut self, src: &[u8]) {
        self.reserve(src.len());

        self.write_buf()[..src.len()].copy_from_slice(src);
        self.write_commit(src.len());
    }

    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.read_buf().to_vec();
        self.clear();

        out
    }
}

impl Read for FrameBuffer {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let src = self.read_buf();
        let size = cmp::min(src.len(), buf.len());

        buf[..size].copy_from_slice(&src[..size]);

        self.read_commit(size);

        Ok(size)
    }
}

impl Write for FrameBuffer {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        if !buf.is_empty() && self.write_avail() == 0 {
            self.compact();

            if self.write_avail() == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
        }

        let dest = self.write_buf();
        let size = cmp::min(dest.len(), buf.len());

        dest[..size].copy_from_slice(&buf[..size]);

        self.write_commit(size);

        Ok(size)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_buffer_read_write() {
        let mut b = FrameBuffer::new(64);
        assert_eq!(b.capacity(), 64);
        assert_eq!(b.is_empty(), true);

        assert_eq!(b.write(b"hello").unwrap(), 5);
        assert_eq!(b.read_avail(), 5);
        assert_eq!(b.read_buf(), b"hello");

        let mut out = [0; 3];
        assert_eq!(b.read(&mut out).unwrap(), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(b.read_buf(), b"lo");

        b.read_commit(2);
        assert_eq!(b.is_empty(), true);
        assert_eq!(b.write_avail(), 64);
    }

    #[test]
    fn frame_buffer_write_full() {
        let mut b = FrameBuffer::new(64);

        let data = [7u8; 64];
        assert_eq!(b.write(&data).unwrap(), 64);

        let e = b.write(b"x").unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::WriteZero);

        // consuming frees space at the front, which write reclaims
        b.read_commit(10);
        assert_eq!(b.write(b"abc").unwrap(), 3);
        assert_eq!(b.read_avail(), 57);
        assert_eq!(&b.read_buf()[54..], b"abc");
    }

    #[test]
    fn frame_buffer_grow_preserves_content() {
        let mut b = FrameBuffer::new(64);

        let data: Vec<u8> = (0..60).collect();
        b.append(&data);
        b.read_commit(5);

        let before = b.read_buf().to_vec();

        let mut caps = vec![b.capacity()];
        for _ in 0..3 {
            caps.push(b.grow());
            assert_eq!(b.read_buf(), before.as_slice());
        }

        assert_eq!(caps, vec![64, 128, 256, 512]);
    }

    #[test]
    fn frame_buffer_append_doubles() {
        let mut b = FrameBuffer::new(64);

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        b.append(&data[..100]);
        assert_eq!(b.capacity(), 128);

        b.append(&data[100..]);
        assert_eq!(b.capacity(), 256);
        assert_eq!(b.read_buf(), data.as_slice());

        assert_eq!(b.take_all(), data);
        assert_eq!(b.is_empty(), true);
        assert_eq!(b.capacity(), 256);
    }

    #[test]
    fn frame_buffer_reserve_compacts_first() {
        let mut b = FrameBuffer::new(64);

        b.append(&[1; 40]);
        b.read_commit(30);

        b.reserve(50);
        assert_eq!(b.capacity(), 64);
        assert_eq!(b.read_buf(), &[1; 10]);
    }
}
