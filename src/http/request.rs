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

use super::Method;
use std::str;

// some reasonable number
pub const HEADERS_MAX: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Parse(#[from] httparse::Error),

    // the head is cut short, e.g. in the middle of the version
    #[error("request not yet parseable")]
    Incomplete,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("body shorter than declared")]
    ShortBody,
}

fn split_pairs<'a>(s: &'a str, sep: char) -> impl Iterator<Item = (String, String)> + 'a {
    s.split(sep).filter_map(|part| {
        let part = part.trim();

        if part.is_empty() {
            return None;
        }

        Some(match part.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (part.to_string(), String::new()),
        })
    })
}

// a fully parsed request. the raw bytes are kept so the request can be
// relayed verbatim
#[derive(Debug, Clone)]
pub struct Request {
    raw: Vec<u8>,
    method: Method,
    method_str: String,
    target: String,
    path: String,
    version: u8,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body_start: usize,
    body_len: usize,
}

impl Request {
    pub fn parse(raw: Vec<u8>) -> Result<Self, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(&raw)? {
            httparse::Status::Complete(size) => size,
            httparse::Status::Partial => return Err(ParseError::Incomplete),
        };

        let (method_str, target, version) = match (req.method, req.path, req.version) {
            (Some(m), Some(p), Some(v)) => (m.to_string(), p.to_string(), v),
            _ => return Err(ParseError::Incomplete),
        };

        let method = Method::from_token(method_str.as_bytes());

        let mut out_headers = Vec::with_capacity(req.headers.len());

        for h in req.headers.iter() {
            out_headers.push((
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            ));
        }

        let mut body_len = 0;

        if method.has_body() {
            for (name, value) in out_headers.iter() {
                if name.eq_ignore_ascii_case("content-length") {
                    body_len = value
                        .trim()
                        .parse()
                        .map_err(|_| ParseError::InvalidContentLength)?;
                    break;
                }
            }
        }

        if raw.len() < head_len + body_len {
            return Err(ParseError::ShortBody);
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), split_pairs(query, '&').collect()),
            None => (target.clone(), Vec::new()),
        };

        let mut cookies = Vec::new();

        for (name, value) in out_headers.iter() {
            if name.eq_ignore_ascii_case("cookie") {
                cookies.extend(split_pairs(value, ';'));
            }
        }

        Ok(Self {
            raw,
            method,
            method_str,
            target,
            path,
            version,
            headers: out_headers,
            cookies,
            query,
            body_start: head_len,
            body_len,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn method_str(&self) -> &str {
        &self.method_str
    }

    // path and query as sent
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    // minor version, i.e. 1 for HTTP/1.1
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.raw[self.body_start..(self.body_start + self.body_len)]
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    pub fn is_persistent(&self) -> bool {
        let conn = self.header("Connection").map(|v| v.trim().to_ascii_lowercase());

        match conn.as_deref() {
            Some("close") => false,
            Some("keep-alive") => true,
            _ => self.version >= 1,
        }
    }
}
