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

use crate::balancer::BalancerError;
use crate::bridge::BridgeError;
use crate::http::{Disposition, Method, Request, Response};
use log::{debug, error, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Balancer(_) => 503,
            Self::Bridge(BridgeError::Timeout) => 504,
            Self::Bridge(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

pub trait Handler: Send + Sync {
    fn handle(&self, req: &Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Result<Response, HandlerError> + Send + Sync,
{
    fn handle(&self, req: &Request) -> Result<Response, HandlerError> {
        self(req)
    }
}

struct Route {
    prefix: String,

    // empty means any
    methods: Vec<Method>,

    handler: Arc<dyn Handler>,
}

impl Route {
    fn allows(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }
}

pub enum Lookup<'a> {
    Found(&'a Arc<dyn Handler>),
    MethodNotAllowed,
    NotFound,
}

#[derive(Default)]
pub struct RoutesBuilder {
    routes: Vec<Route>,
}

impl RoutesBuilder {
    pub fn add(mut self, prefix: &str, methods: &[Method], handler: Arc<dyn Handler>) -> Self {
        self.routes.push(Route {
            prefix: prefix.to_string(),
            methods: methods.to_vec(),
            handler,
        });

        self
    }

    pub fn build(mut self) -> Routes {
        // ascending by length, scanned from the end. the sort is stable so
        // among equal prefixes the last registered is tried first
        self.routes.sort_by_key(|r| r.prefix.len());

        Routes {
            routes: self.routes,
        }
    }
}

// path prefix and method set to handler, fixed once built
pub struct Routes {
    routes: Vec<Route>,
}

impl Routes {
    pub fn builder() -> RoutesBuilder {
        RoutesBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn lookup(&self, method: Method, path: &str) -> Lookup {
        let mut prefix_matched = false;

        for r in self.routes.iter().rev() {
            if !path.starts_with(&r.prefix) {
                continue;
            }

            if r.allows(method) {
                return Lookup::Found(&r.handler);
            }

            prefix_matched = true;
        }

        if prefix_matched {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NotFound
        }
    }

    // run the matching handler. failures, including panics, become error
    // responses
    pub fn dispatch(&self, req: &Request) -> Response {
        let handler = match self.lookup(req.method(), req.path()) {
            Lookup::Found(h) => h,
            Lookup::MethodNotAllowed => return Response::error(405),
            Lookup::NotFound => return Response::error(404),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(req))) {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let code = e.status();

                if code >= 500 {
                    error!("handler failed for {} {}: {}", req.method_str(), req.path(), e);
                } else {
                    warn!("handler rejected {} {}: {}", req.method_str(), req.path(), e);
                }

                Response::error(code)
            }
            Err(_) => {
                error!("handler panicked for {} {}", req.method_str(), req.path());

                Response::error(500)
            }
        }
    }

    // parse a raw message and dispatch it. a response to a request that
    // asked for the connection to end carries that through
    pub fn serve(&self, raw: Vec<u8>) -> Response {
        let req = match Request::parse(raw) {
            Ok(req) => req,
            Err(e) => {
                debug!("unparseable request: {}", e);

                return Response::error(400).then(Disposition::Close);
            }
        };

        let mut resp = self.dispatch(&req);

        if !req.is_persistent() && resp.disposition() == Disposition::KeepAlive {
            resp.set_disposition(Disposition::Close);
        }

        resp
    }
}
