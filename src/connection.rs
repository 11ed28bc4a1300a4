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

use crate::core::buffer::FrameBuffer;
use crate::core::net::{wait_fd, Wait};
use crate::tls::{TlsChannel, APPLICATION_BUFFER_SIZE};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

const PLAIN_READ_SIZE: usize = 16_384;

// largest single write handed to the socket
const PLAIN_WRITE_CAPACITY: usize = 65_536;

pub struct PlainChannel {
    stream: TcpStream,
    buf: FrameBuffer,
    eof: bool,
}

impl PlainChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: FrameBuffer::new(PLAIN_READ_SIZE),
            eof: false,
        }
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, io::Error> {
        while !self.eof {
            if self.buf.write_avail() == 0 {
                self.buf.grow();
            }

            match self.stream.read(self.buf.write_buf()) {
                Ok(0) => self.eof = true,
                Ok(size) => self.buf.write_commit(size),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if !self.buf.is_empty() {
            return Ok(Some(self.buf.take_all()));
        }

        if self.eof {
            return Ok(None);
        }

        Ok(Some(Vec::new()))
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), io::Error> {
        let deadline = Instant::now() + timeout;

        let mut pos = 0;

        while pos < data.len() {
            match self.stream.write(&data[pos..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(size) => pos += size,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let left = deadline.saturating_duration_since(Instant::now());

                    if left.is_zero()
                        || !wait_fd(self.stream.as_raw_fd(), Wait::Writable, Some(left))?
                    {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn write_some(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        loop {
            match self.stream.write(data) {
                Ok(0) if !data.is_empty() => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero))
                }
                Ok(size) => return Ok(size),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }
}

// a client connection, either cleartext or encrypted
pub enum Channel {
    Plain(PlainChannel),
    Tls(Box<TlsChannel>),
}

impl Channel {
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(PlainChannel::new(stream))
    }

    pub fn tls(channel: TlsChannel) -> Self {
        Self::Tls(Box::new(channel))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub fn stream(&self) -> &TcpStream {
        match self {
            Self::Plain(c) => &c.stream,
            Self::Tls(c) => c.stream(),
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Self::Plain(c) => &mut c.stream,
            Self::Tls(c) => c.stream_mut(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream().peer_addr().ok()
    }

    // all application bytes available without blocking. an empty vec
    // means nothing yet, None means the peer closed
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, io::Error> {
        match self {
            Self::Plain(c) => c.read(),
            Self::Tls(c) => c.read(),
        }
    }

    // largest chunk to pass to write_all at once
    pub fn write_capacity(&self) -> usize {
        match self {
            Self::Plain(_) => PLAIN_WRITE_CAPACITY,
            Self::Tls(_) => APPLICATION_BUFFER_SIZE,
        }
    }

    pub fn write_all(&mut self, data: &[u8], timeout: Duration) -> Result<(), io::Error> {
        match self {
            Self::Plain(c) => c.write(data, timeout),
            Self::Tls(c) => c.write(data, timeout),
        }
    }

    // hand the socket as much of data as it takes without waiting.
    // returns the number of bytes consumed
    pub fn write_some(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Plain(c) => c.write_some(data),
            Self::Tls(c) => c.write_some(data),
        }
    }

    // push out output buffered by earlier writes without waiting. true
    // when nothing is left
    pub fn flush_pending(&mut self) -> Result<bool, io::Error> {
        match self {
            Self::Plain(_) => Ok(true),
            Self::Tls(c) => c.flush_pending(),
        }
    }

    // write in chunks no larger than the write capacity
    pub fn write_chunked(&mut self, data: &[u8], timeout: Duration) -> Result<(), io::Error> {
        let capacity = self.write_capacity();

        for chunk in data.chunks(capacity) {
            self.write_all(chunk, timeout)?;
        }

        Ok(())
    }

    pub fn close(&mut self) {
        if let Self::Tls(c) = self {
            c.close();
        }

        let _ = self.stream().shutdown(Shutdown::Both);
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn pair() -> (Channel, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        (Channel::plain(TcpStream::from_std(server)), client)
    }

    #[test]
    fn plain_read_and_eof() {
        let (mut c, mut client) = pair();

        assert_eq!(c.read().unwrap(), Some(Vec::new()));

        client.write_all(b"hello").unwrap();

        assert!(wait_fd(c.as_raw_fd(), Wait::Readable, Some(Duration::from_secs(5))).unwrap());
        assert_eq!(c.read().unwrap(), Some(b"hello".to_vec()));

        drop(client);

        assert!(wait_fd(c.as_raw_fd(), Wait::Readable, Some(Duration::from_secs(5))).unwrap());
        assert_eq!(c.read().unwrap(), None);
    }

    #[test]
    fn plain_write_chunked() {
        let (mut c, mut client) = pair();

        let data = vec![b'x'; PLAIN_WRITE_CAPACITY + 10];

        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            let mut buf = [0; 4096];

            while out.len() < PLAIN_WRITE_CAPACITY + 10 {
                let size = client.read(&mut buf).unwrap();
                assert!(size > 0);
                out.extend_from_slice(&buf[..size]);
            }

            out
        });

        c.write_chunked(&data, Duration::from_secs(5)).unwrap();

        assert_eq!(reader.join().unwrap(), data);
        assert!(!c.is_tls());
    }

    #[test]
    fn plain_write_some_stops_when_full() {
        let (mut c, mut client) = pair();

        let data = vec![b'y'; 1024 * 1024];

        // nobody reads yet, so the socket eventually refuses more
        let mut pos = 0;
        loop {
            let size = c.write_some(&data[pos..]).unwrap();
            if size == 0 {
                break;
            }

            pos += size;

            if pos == data.len() {
                pos = 0;
            }
        }

        assert!(c.flush_pending().unwrap());

        let mut buf = [0; 4096];
        assert!(client.read(&mut buf).unwrap() > 0);
    }
}
