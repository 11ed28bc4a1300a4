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

//! The bridge carries raw HTTP messages between the front tier and REST
//! workers. Each terminator holds one [`BridgePeer`] per attached worker and
//! forwards requests through it; the worker side serves requests arriving on
//! its links (see [`link`]).

pub mod frame;
pub mod link;
pub mod peer;

pub use peer::BridgePeer;

use crate::tls::TlsError;
use frame::FrameError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("bridge peer closed")]
    Closed,

    #[error("bridge round trip timed out")]
    Timeout,

    #[error("attach rejected: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    BadResponse(String),
}
