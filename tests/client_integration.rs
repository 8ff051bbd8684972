//! End-to-end tests driving the full stack against canned TCP servers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_http::{
    Body, Client, Error, Headers, Method, PoolConfig, RequestOptions, ResponseBody, ResponseSink,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

enum Reply {
    /// Write bytes; keep the connection open for more requests when true.
    Send(Vec<u8>, bool),
    /// Close the connection without answering.
    CloseNow,
    /// Never answer.
    Stall,
}

struct TestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    conns: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn conns(&self) -> usize {
        self.conns.load(Ordering::SeqCst)
    }

    fn head(&self, index: usize) -> String {
        self.heads.lock().unwrap()[index].clone()
    }

    fn body(&self, index: usize) -> Vec<u8> {
        self.bodies.lock().unwrap()[index].clone()
    }
}

fn ok_response(body: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
}

fn status_response(status: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n").into_bytes()
}

async fn spawn_server<F>(respond: F) -> TestServer
where
    F: Fn(usize, &str) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let conns = Arc::new(AtomicUsize::new(0));
    let heads = Arc::new(Mutex::new(Vec::new()));
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    {
        let hits = hits.clone();
        let conns = conns.clone();
        let heads = heads.clone();
        let bodies = bodies.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                conns.fetch_add(1, Ordering::SeqCst);
                let hits = hits.clone();
                let heads = heads.clone();
                let bodies = bodies.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    loop {
                        let Some((head, body)) = read_request(&mut sock).await else { break };
                        let hit = hits.fetch_add(1, Ordering::SeqCst) + 1;
                        heads.lock().unwrap().push(head.clone());
                        bodies.lock().unwrap().push(body);
                        match (respond.as_ref())(hit, &head) {
                            Reply::Send(bytes, keep_open) => {
                                if sock.write_all(&bytes).await.is_err() {
                                    break;
                                }
                                if !keep_open {
                                    break;
                                }
                            }
                            Reply::CloseNow => break,
                            Reply::Stall => {
                                tokio::time::sleep(Duration::from_secs(30)).await;
                                break;
                            }
                        }
                    }
                });
            }
        });
    }

    TestServer { addr, hits, conns, heads, bodies }
}

/// Read one request head plus its Content-Length body.
async fn read_request(sock: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut raw: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = sock.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let mut body = raw[head_end..].to_vec();
    let expected = content_length(&head);
    while body.len() < expected {
        let n = sock.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    Some((head, body))
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

fn no_retry() -> RequestOptions {
    RequestOptions { retry: false, ..RequestOptions::default() }
}

/// Honor RUST_LOG when debugging a test run.
fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn get_buffers_body_and_pools_connection() {
    init_logs();
    let server = spawn_server(|_, _| Reply::Send(ok_response("hello"), true)).await;
    let client = Client::new();

    let response = client
        .request(Method::GET, &server.url("/a"), Headers::new(), Body::Empty, no_retry())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");
    assert_eq!(client.pool_stats().idle, 1);

    // Same origin again: the pooled connection serves the second request.
    let response = client
        .request(Method::GET, &server.url("/b"), Headers::new(), Body::Empty, no_retry())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(server.hits(), 2);
    assert_eq!(server.conns(), 1);
    client.close_all();
}

#[tokio::test]
async fn server_initiated_close_is_replaced_by_fresh_connection() {
    let server = spawn_server(|_, _| {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok".to_vec();
        Reply::Send(raw, false)
    })
    .await;
    let client = Client::new();

    for _ in 0..2 {
        let response = client
            .request(Method::GET, &server.url("/a"), Headers::new(), Body::Empty, no_retry())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "ok");
    }
    assert_eq!(server.conns(), 2, "closed connection must not be reused");
    assert_eq!(client.pool_stats().idle, 0);
}

#[tokio::test]
async fn post_retries_on_500_with_exponential_backoff() {
    let server = spawn_server(|_, _| Reply::Send(status_response(500, "Internal Server Error"), true)).await;
    let client = Client::new();

    let opts = RequestOptions {
        retries: 2,
        retry_delay: Duration::from_millis(10),
        retry_non_idempotent: true,
        ..RequestOptions::default()
    };
    let started = Instant::now();
    let err = client
        .request(Method::POST, &server.url("/x"), Headers::new(), Body::from("data"), opts)
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(server.hits(), 3, "one initial attempt plus two retries");
    // Backoff 10ms then 100ms.
    assert!(started.elapsed() >= Duration::from_millis(110));
    // Every attempt carried the body.
    for i in 0..3 {
        assert_eq!(server.body(i), b"data");
    }
}

#[tokio::test]
async fn streamed_body_is_never_retried() {
    let server = spawn_server(|_, _| Reply::Send(status_response(500, "Internal Server Error"), true)).await;
    let client = Client::new();

    let opts = RequestOptions {
        retries: 2,
        retry_delay: Duration::from_millis(10),
        retry_non_idempotent: true,
        ..RequestOptions::default()
    };
    let body = Body::from_reader(std::io::Cursor::new(b"data".to_vec()), Some(4));
    let err = client
        .request(Method::POST, &server.url("/x"), Headers::new(), body, opts)
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(server.hits(), 1, "unreplayable body must not be re-sent");
}

#[tokio::test]
async fn non_idempotent_methods_are_not_retried_by_default() {
    let server = spawn_server(|_, _| Reply::Send(status_response(500, "Internal Server Error"), true)).await;
    let client = Client::new();

    let opts = RequestOptions {
        retries: 3,
        retry_delay: Duration::from_millis(10),
        ..RequestOptions::default()
    };
    let err = client
        .request(Method::POST, &server.url("/x"), Headers::new(), Body::from("data"), opts)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn io_error_is_retried_on_a_fresh_connection() {
    let server = spawn_server(|hit, _| {
        if hit == 1 {
            Reply::CloseNow
        } else {
            Reply::Send(ok_response("recovered"), true)
        }
    })
    .await;
    let client = Client::new();

    let opts = RequestOptions {
        retries: 2,
        retry_delay: Duration::from_millis(10),
        ..RequestOptions::default()
    };
    let response = client
        .request(Method::GET, &server.url("/a"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "recovered");
    assert_eq!(server.hits(), 2);
    assert_eq!(server.conns(), 2);
}

#[tokio::test]
async fn cross_origin_redirect_strips_authorization() {
    let target = spawn_server(|_, _| Reply::Send(ok_response("from-target"), true)).await;
    let target_url = target.url("/b");
    let redirecting = spawn_server(move |_, _| {
        let raw = format!(
            "HTTP/1.1 302 Found\r\nLocation: {target_url}\r\nContent-Length: 0\r\n\r\n"
        );
        Reply::Send(raw.into_bytes(), true)
    })
    .await;
    let client = Client::new();

    let headers = Headers::from_pairs([
        ("Authorization", "Bearer secret"),
        ("X-Custom", "carried"),
    ]);
    let opts = RequestOptions { forward_headers: true, retry: false, ..RequestOptions::default() };
    let response = client
        .request(Method::GET, &redirecting.url("/a"), headers, Body::Empty, opts)
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "from-target");

    let first_hop = redirecting.head(0);
    assert!(first_hop.contains("Authorization: Bearer secret"));

    let second_hop = target.head(0);
    assert!(second_hop.contains("X-Custom: carried"), "head: {second_hop}");
    assert!(!second_hop.to_ascii_lowercase().contains("authorization"), "head: {second_hop}");
    assert!(second_hop.contains(&format!("Host: {}", target.addr)));

    // History: the final response's request chain records the first hop.
    let request = response.request.unwrap();
    assert_eq!(request.chain_len(), 2);
}

#[tokio::test]
async fn redirect_limit_is_enforced() {
    let server = spawn_server(|_, _| {
        let raw = b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n".to_vec();
        Reply::Send(raw, true)
    })
    .await;
    let client = Client::new();

    let opts = RequestOptions { redirect_limit: 2, retry: false, ..RequestOptions::default() };
    let err = client
        .request(Method::GET, &server.url("/a"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooManyRedirects(2)));
    assert_eq!(server.hits(), 3, "initial request plus two follows");
}

#[tokio::test]
async fn see_other_rewrites_method_to_get() {
    let server = spawn_server(|hit, _| {
        if hit == 1 {
            let raw = b"HTTP/1.1 303 See Other\r\nLocation: /result\r\nContent-Length: 0\r\n\r\n".to_vec();
            Reply::Send(raw, true)
        } else {
            Reply::Send(ok_response("made"), true)
        }
    })
    .await;
    let client = Client::new();

    let response = client
        .request(Method::POST, &server.url("/make"), Headers::new(), Body::from("payload"), no_retry())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(server.head(0).starts_with("POST /make"));
    assert!(server.head(1).starts_with("GET /result"));
    assert_eq!(server.body(1), b"", "303 follow must drop the body");
}

#[tokio::test]
async fn read_timeout_fires_and_connection_is_not_pooled() {
    let server = spawn_server(|_, _| {
        // Headers promise a body that never arrives.
        Reply::Send(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n".to_vec(), true)
    })
    .await;
    let client = Client::new();

    let opts = RequestOptions {
        read_timeout: Duration::from_millis(200),
        retry: false,
        ..RequestOptions::default()
    };
    let started = Instant::now();
    let err = client
        .request(Method::GET, &server.url("/slow"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ReadTimeout(_)), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.pool_stats().idle, 0, "timed-out connection must be closed");
}

#[tokio::test]
async fn total_timeout_bounds_the_whole_call() {
    let server = spawn_server(|_, _| Reply::Stall).await;
    let client = Client::new();

    let opts = RequestOptions {
        total_timeout: Some(Duration::from_millis(200)),
        retry: false,
        ..RequestOptions::default()
    };
    let err = client
        .request(Method::GET, &server.url("/never"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestTimeout(_)));
}

#[tokio::test]
async fn status_exception_disabled_returns_error_statuses() {
    let server = spawn_server(|_, _| Reply::Send(status_response(404, "Not Found"), true)).await;
    let client = Client::new();

    let opts = RequestOptions { status_exception: false, retry: false, ..RequestOptions::default() };
    let response = client
        .request(Method::GET, &server.url("/missing"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap();
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn status_error_carries_the_full_response() {
    let server = spawn_server(|_, _| {
        Reply::Send(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope".to_vec(),
            true,
        )
    })
    .await;
    let client = Client::new();

    let err = client
        .request(Method::GET, &server.url("/missing"), Headers::new(), Body::Empty, no_retry())
        .await
        .unwrap_err();
    match err {
        Error::Status { status, response } => {
            assert_eq!(status, 404);
            assert_eq!(response.text(), "nope");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn basic_auth_is_derived_from_url_userinfo() {
    let server = spawn_server(|_, _| Reply::Send(ok_response("in"), true)).await;
    let client = Client::new();

    let url = format!("http://user:pass@{}/private", server.addr);
    let opts = RequestOptions { basic_authorization: true, retry: false, ..RequestOptions::default() };
    let response = client
        .request(Method::GET, &url, Headers::new(), Body::Empty, opts)
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    let head = server.head(0);
    // base64("user:pass")
    assert!(head.contains("Authorization: Basic dXNlcjpwYXNz"), "head: {head}");
    assert!(head.starts_with("GET /private HTTP/1.1"), "userinfo must not reach the target line");
}

#[tokio::test]
async fn cookies_learned_then_sent() {
    let server = spawn_server(|hit, _| {
        if hit == 1 {
            let raw =
                b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=abc123\r\nContent-Length: 2\r\n\r\nok".to_vec();
            Reply::Send(raw, true)
        } else {
            Reply::Send(ok_response("again"), true)
        }
    })
    .await;
    let client = Client::new();

    let opts = || RequestOptions { cookies: true, retry: false, ..RequestOptions::default() };
    client
        .request(Method::GET, &server.url("/login"), Headers::new(), Body::Empty, opts())
        .await
        .unwrap();
    client
        .request(Method::GET, &server.url("/account"), Headers::new(), Body::Empty, opts())
        .await
        .unwrap();

    assert!(!server.head(0).contains("Cookie:"));
    assert!(server.head(1).contains("Cookie: sid=abc123"), "head: {}", server.head(1));
}

#[tokio::test]
async fn chunked_response_over_tcp_is_decoded_and_reused() {
    let server = spawn_server(|_, _| {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    7\r\nchunked\r\n8\r\n response\r\n0\r\n\r\n"
            .to_vec();
        Reply::Send(raw, true)
    })
    .await;
    let client = Client::new();

    let response = client
        .request(Method::GET, &server.url("/c"), Headers::new(), Body::Empty, no_retry())
        .await
        .unwrap();
    assert_eq!(response.text(), "chunked response");
    assert_eq!(client.pool_stats().idle, 1);
}

#[tokio::test]
async fn saturated_pool_fails_with_connect_timeout() {
    let server = spawn_server(|_, _| Reply::Stall).await;
    let client = Arc::new(Client::with_config(PoolConfig {
        connection_limit_per_host: 1,
        ..PoolConfig::default()
    }));

    let blocker = {
        let client = client.clone();
        let url = server.url("/hold");
        tokio::spawn(async move {
            let opts = RequestOptions {
                read_timeout: Duration::from_secs(2),
                retry: false,
                ..RequestOptions::default()
            };
            let _ = client.request(Method::GET, &url, Headers::new(), Body::Empty, opts).await;
        })
    };

    // Give the first request time to occupy the only slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let opts = RequestOptions {
        connect_timeout: Duration::from_millis(200),
        retry: false,
        ..RequestOptions::default()
    };
    let err = client
        .request(Method::GET, &server.url("/second"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectTimeout(_)), "got {err:?}");
    blocker.abort();
}

#[tokio::test]
async fn response_stream_sink_receives_the_body() {
    let server = spawn_server(|_, _| Reply::Send(ok_response("sinked"), true)).await;
    let client = Client::new();

    let (writer, mut reader) = tokio::io::duplex(1024);
    let opts = RequestOptions {
        response_stream: Some(ResponseSink::new(writer)),
        retry: false,
        ..RequestOptions::default()
    };
    let response = client
        .request(Method::GET, &server.url("/s"), Headers::new(), Body::Empty, opts)
        .await
        .unwrap();

    assert_eq!(response.body, ResponseBody::Streamed);
    let mut received = [0u8; 6];
    reader.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"sinked");
}

#[tokio::test]
async fn open_gives_the_callback_the_raw_stream() {
    let server = spawn_server(|_, _| Reply::Send(ok_response("manual"), true)).await;
    let client = Client::new();

    let headers = Headers::from_pairs([("Content-Length", "4")]);
    let response = client
        .open(Method::POST, &server.url("/up"), headers, no_retry(), |mut raw| async move {
            raw.write_body(b"data").await?;
            raw.finish_body().await?;
            raw.read_response().await?;
            assert_eq!(raw.status(), Some(200));
            let mut collected = Vec::new();
            while let Some(chunk) = raw.read_body_chunk().await? {
                collected.extend_from_slice(&chunk);
            }
            assert_eq!(collected, b"manual");
            Ok(raw)
        })
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, ResponseBody::Streamed);
    assert_eq!(server.body(0), b"data");
    // The manual exchange still negotiated keep-alive.
    assert_eq!(client.pool_stats().idle, 1);
}

#[tokio::test]
async fn chunked_request_body_reaches_the_server_framed() {
    // The generic helper cannot parse chunked uploads, so this server
    // reads until the terminal chunk marker by hand.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_srv = seen.clone();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        while !raw.windows(5).any(|w| w == b"0\r\n\r\n") {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        seen_srv.lock().unwrap().extend_from_slice(&raw);
        sock.write_all(&status_response(201, "Created")).await.unwrap();
    });

    let client = Client::new();
    let body = Body::from_reader(std::io::Cursor::new(b"streamed payload".to_vec()), None);
    let opts = RequestOptions { status_exception: false, retry: false, ..RequestOptions::default() };
    let response = client
        .request(Method::POST, &format!("http://{addr}/up"), Headers::new(), body, opts)
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    let raw = seen.lock().unwrap().clone();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("Transfer-Encoding: chunked"), "{text}");
    assert!(text.contains("10\r\nstreamed payload\r\n0\r\n\r\n"), "{text}");
}

#[tokio::test]
async fn message_layer_fills_standard_headers() {
    let server = spawn_server(|_, _| Reply::Send(ok_response("ok"), true)).await;
    let client = Client::new();

    client
        .request(Method::GET, &server.url("/h"), Headers::new(), Body::Empty, no_retry())
        .await
        .unwrap();

    let head = server.head(0);
    assert!(head.contains(&format!("Host: {}", server.addr)), "head: {head}");
    assert!(head.contains("User-Agent: courier-http/"), "head: {head}");
    assert!(head.contains("Accept: */*"), "head: {head}");
    assert!(!head.to_ascii_lowercase().contains("content-length"), "GET without body: {head}");
}

#[tokio::test]
async fn canonicalize_rewrites_outgoing_header_names() {
    let server = spawn_server(|_, _| Reply::Send(ok_response("ok"), true)).await;
    let client = Client::new();

    let headers = Headers::from_pairs([("x-custom-tag", "v")]);
    let opts = RequestOptions { canonicalize_headers: true, retry: false, ..RequestOptions::default() };
    client
        .request(Method::GET, &server.url("/c"), headers, Body::Empty, opts)
        .await
        .unwrap();
    assert!(server.head(0).contains("X-Custom-Tag: v"), "head: {}", server.head(0));
}

#[tokio::test]
async fn detect_content_type_sniffs_json() {
    let server = spawn_server(|_, _| Reply::Send(ok_response("ok"), true)).await;
    let client = Client::new();

    let opts = RequestOptions { detect_content_type: true, retry: false, ..RequestOptions::default() };
    client
        .request(
            Method::POST,
            &server.url("/j"),
            Headers::new(),
            Body::from(r#"{"k":1}"#),
            opts,
        )
        .await
        .unwrap();
    assert!(server.head(0).contains("Content-Type: application/json"), "head: {}", server.head(0));
}
