use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kino::http::request::parse;

const REQ: &[u8] = b"\
GET / HTTP/1.1\r\n\
Host: kino.local\r\n\r\n";

const REQ_STREAM: &[u8] = b"\
GET /videos/bunny.mp4 HTTP/1.1\r\n\
Host: kino.local\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\
Accept: video/webm,video/ogg,video/*;q=0.9,application/ogg;q=0.7,audio/*;q=0.6,*/*;q=0.5\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: identity\r\n\
Range: bytes=1048576-\r\n\
Cookie: theme=dark; session_id=h2Y4kD8s1Vbq3LrX0wNzAeP5tGcUfJmo; lang=en\r\n\
Connection: keep-alive\r\n\r\n";

const REQ_LOGIN: &[u8] = b"\
POST /login HTTP/1.1\r\n\
Host: kino.local\r\n\
Content-Type: application/x-www-form-urlencoded\r\n\
Content-Length: 28\r\n\
Connection: keep-alive\r\n\r\n\
username=user1&password=1234";

fn benchmark(c: &mut Criterion) {
    let inputs = [("minimal", REQ), ("stream", REQ_STREAM), ("login", REQ_LOGIN)];

    let mut group = c.benchmark_group("parse");
    for (name, input) in inputs.iter() {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("head", *name), input, |b, i| {
            b.iter(|| {
                let _ = parse(i);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
