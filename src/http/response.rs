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

use super::assembler::HEADER_END;
use super::request::HEADERS_MAX;
use crate::core::time::http_date_now;
use std::io::Write;

pub const SERVER_NAME: &str = concat!("relaygate/", env!("CARGO_PKG_VERSION"));

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

// what happens to the connection after the response is written
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    KeepAlive,
    Close,

    // hand the connection over to the bridge as the link to this member
    Promote { member_id: u16, started_ms: i64 },

    // begin process shutdown once the response is out
    Shutdown,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RawResponseError {
    #[error("no header terminator")]
    NoHeaderEnd,

    #[error(transparent)]
    Parse(#[from] httparse::Error),
}

#[derive(Debug)]
pub struct Response {
    code: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    raw: bool,
    header_end: usize,
    page: Option<Vec<u8>>,
    disposition: Disposition,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            code: None,
            headers: Vec::new(),
            body: Vec::new(),
            raw: false,
            header_end: 0,
            page: None,
            disposition: Disposition::KeepAlive,
        }
    }

    pub fn with_status(code: u16) -> Self {
        let mut resp = Self::new();
        resp.set_status(code);

        resp
    }

    // a fixed plain-text page for the given status
    pub fn error(code: u16) -> Self {
        let mut resp = Self::with_status(code);
        resp.set_body(format!("{} {}\n", code, reason_phrase(code)).into_bytes());

        resp
    }

    // wrap a complete response received from elsewhere. it is written out
    // as is, without finishing
    pub fn from_raw(data: Vec<u8>) -> Result<Self, RawResponseError> {
        let header_end = match data.windows(HEADER_END.len()).position(|w| w == HEADER_END) {
            Some(pos) => pos,
            None => return Err(RawResponseError::NoHeaderEnd),
        };

        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut resp = httparse::Response::new(&mut headers);

        resp.parse(&data[..(header_end + HEADER_END.len())])?;

        let code = resp.code;

        Ok(Self {
            code,
            headers: Vec::new(),
            body: Vec::new(),
            raw: true,
            header_end,
            page: Some(data),
            disposition: Disposition::KeepAlive,
        })
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    // raw responses are immutable apart from their disposition
    pub fn set_status(&mut self, code: u16) {
        if self.raw {
            return;
        }

        self.code = Some(code);
        self.page = None;
    }

    pub fn status(&self) -> u16 {
        self.code.unwrap_or(200)
    }

    // duplicates are permitted and order is kept
    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.raw {
            return;
        }

        self.headers.push((name.to_string(), value.to_string()));
        self.page = None;
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.add_header(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        if self.raw {
            return;
        }

        self.body = body;
        self.page = None;
    }

    pub fn body(&self) -> &[u8] {
        match (&self.page, self.raw) {
            (Some(page), true) => &page[(self.header_end + HEADER_END.len())..],
            _ => &self.body,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    pub fn then(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;

        self
    }

    // add the headers every locally generated response carries. a raw
    // response only has its connection headers corrected when closing
    pub fn stamp(&mut self, keep_alive_secs: u64) {
        if self.raw {
            if self.disposition != Disposition::KeepAlive {
                self.close_raw();
            }

            return;
        }

        self.set_header("Server", SERVER_NAME);
        self.set_header("Date", &http_date_now());

        if self.disposition == Disposition::KeepAlive {
            self.set_header("Connection", "Keep-Alive");
            self.set_header("Keep-Alive", &format!("timeout={}", keep_alive_secs));
        } else {
            self.set_header("Connection", "close");
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("Keep-Alive"));
        }
    }

    fn close_raw(&mut self) {
        let page = match self.page.take() {
            Some(page) => page,
            None => return,
        };

        let body_start = self.header_end + HEADER_END.len();

        let mut out = Vec::with_capacity(page.len() + 32);

        for (i, line) in page[..self.header_end].split(|b| *b == b'\n').enumerate() {
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if i > 0 {
                let name = match line.iter().position(|b| *b == b':') {
                    Some(pos) => &line[..pos],
                    None => line,
                };

                let name = String::from_utf8_lossy(name);
                let name = name.trim();

                if name.eq_ignore_ascii_case("Connection") || name.eq_ignore_ascii_case("Keep-Alive")
                {
                    continue;
                }
            }

            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"Connection: close\r\n");

        self.header_end = out.len() - 2;

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&page[body_start..]);

        self.page = Some(out);
    }

    // fix the status, length and type. a no-op for raw responses
    pub fn finish(&mut self) {
        if self.raw {
            return;
        }

        if self.code.is_none() {
            self.code = Some(200);
        }

        let len = self.body.len().to_string();
        self.set_header("Content-Length", &len);

        if self.header("Content-Type").is_none() {
            self.add_header("Content-Type", "text/plain");
        }

        self.page = None;
    }

    // the serialized response. computed once
    pub fn page(&mut self) -> &[u8] {
        if self.page.is_none() {
            let code = self.status();

            let mut out = Vec::with_capacity(128 + self.body.len());

            // writes to a vec cannot fail
            let _ = write!(out, "HTTP/1.1 {} {}\r\n", code, reason_phrase(code));

            for (name, value) in self.headers.iter() {
                let _ = write!(out, "{}: {}\r\n", name, value);
            }

            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.body);

            self.header_end = out.len() - self.body.len() - HEADER_END.len();
            self.page = Some(out);
        }

        match &self.page {
            Some(page) => page.as_slice(),
            None => &[],
        }
    }

    pub fn into_page(mut self) -> Vec<u8> {
        self.page();

        self.page.unwrap_or_default()
    }
}
