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

use log::error;
use mio::net::TcpStream;
use socket2::SockRef;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub fn set_socket_opts(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("set nodelay failed: {:?}", e);
    }

    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        error!("set keepalive failed: {:?}", e);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wait {
    Readable,
    Writable,
}

// block until fd is ready or the timeout elapses. returns false on timeout.
// used by threads that need to wait on a non-blocking socket they do not
// own a poller for
pub fn wait_fd(fd: RawFd, wait: Wait, timeout: Option<Duration>) -> Result<bool, io::Error> {
    let events = match wait {
        Wait::Readable => libc::POLLIN,
        Wait::Writable => libc::POLLOUT,
    };

    let deadline = timeout.map(|d| Instant::now() + d);

    loop {
        let timeout_ms: libc::c_int = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());

                // round up so a sub-millisecond remainder still waits
                let ms = left.as_millis() + u128::from(left.subsec_nanos() % 1_000_000 != 0);

                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
            None => -1,
        };

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };

        // SAFETY: pfd is a valid pollfd for the duration of the call
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

        if ret < 0 {
            let e = io::Error::last_os_error();

            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            return Err(e);
        }

        if ret == 0 {
            return Ok(false);
        }

        // errors and hangups count as ready. the following read or write
        // will surface the actual condition
        return Ok(true);
    }
}

// errors that mean the peer went away during an otherwise healthy session
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
