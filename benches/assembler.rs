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

use criterion::{criterion_group, criterion_main, Criterion};
use relaygate::bridge::frame::{encode_message, FrameDecoder};
use relaygate::http::{Request, RequestAssembler};

const GET: &[u8] = b"GET /api/v1/items?limit=10 HTTP/1.1\r\n\
Host: example.com\r\n\
User-Agent: bench\r\n\
Accept: */*\r\n\
Cookie: session=abc123; theme=dark\r\n\
\r\n";

fn post() -> Vec<u8> {
    let body = vec![b'x'; 16 * 1024];

    let mut out = format!(
        "POST /api/v1/items HTTP/1.1\r\nHost: example.com\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);

    out
}

fn assemble(data: &[u8], chunk: usize) -> Vec<u8> {
    let mut asm = RequestAssembler::new(1024 * 1024);

    for part in data.chunks(chunk) {
        if asm.add(part).unwrap() {
            break;
        }
    }

    asm.finish().0
}

fn criterion_benchmark(c: &mut Criterion) {
    let post = post();

    c.bench_function("assemble get whole", |b| b.iter(|| assemble(GET, GET.len())));

    c.bench_function("assemble get x16", |b| b.iter(|| assemble(GET, 16)));

    c.bench_function("assemble post 16k x1460", |b| {
        b.iter(|| assemble(&post, 1460))
    });

    c.bench_function("assemble and parse get", |b| {
        b.iter(|| Request::parse(assemble(GET, 64)).unwrap())
    });

    c.bench_function("bridge frame encode decode 16k", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            encode_message(7, &post, &mut out).unwrap();

            let mut dec = FrameDecoder::new();
            dec.push(&out);
            dec.next_message().unwrap().unwrap()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
