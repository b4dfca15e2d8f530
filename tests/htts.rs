//! The HTTP server service end to end over loopback: synthesized
//! responses, file serving with ranges and entity tags, CGI, worker
//! threads, and the side-channel handoff.

use std::io::Write;
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hio::http::svr::{Htts, HttsBind, ProcReq};
use hio::http::{self, status};
use hio::{Hio, SkAd};

mod util;
use util::{init, read_one_response, send_request, serve_until};

fn local_bind() -> HttsBind {
    HttsBind::from(SkAd::from(
        "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap(),
    ))
}

fn start_server(hio: &Rc<Hio>, proc_req: ProcReq) -> (Rc<Htts>, std::net::SocketAddr) {
    let htts = Htts::start(hio, vec![local_bind()], proc_req).unwrap();
    let addr = htts.getsockaddr(0).unwrap().to_socket_addr().unwrap();
    (htts, addr)
}

/// Spawns a client exchanging `requests` sequentially on one connection;
/// collected `(head, body)` pairs land in the returned mutex.
fn spawn_client(
    addr: std::net::SocketAddr,
    requests: Vec<Vec<u8>>,
) -> (Arc<Mutex<Vec<(String, Vec<u8>)>>>, Arc<AtomicBool>) {
    let results: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let results2 = results.clone();
    let done2 = done.clone();
    std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for req in requests {
            send_request(&mut stream, &req);
            let res = read_one_response(&mut stream);
            results2.lock().unwrap().push(res);
        }
        done2.store(true, Ordering::SeqCst);
    });
    (results, done)
}

#[test]
fn txt_task_round_trip_with_keep_alive() {
    init();
    let hio = Hio::open(256).unwrap();
    let (_htts, addr) = start_server(
        &hio,
        Box::new(|htts, cli, req| {
            let greeting = format!("hello {}", req.qpath());
            htts.dotxt(cli, req, status::OK, Some("text/plain"), Some(&greeting))
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![
            b"GET /one HTTP/1.1\r\nHost: t\r\n\r\n".to_vec(),
            b"GET /two HTTP/1.1\r\nHost: t\r\n\r\n".to_vec(),
        ],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    let (head, body) = &results[0];
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("Content-Type: text/plain\r\n"));
    assert!(head.contains("Server: "));
    assert!(head.contains("Date: "));
    assert_eq!(body, b"hello /one");
    // The connection was reused for the second request.
    assert_eq!(results[1].1, b"hello /two");
    hio.close();
}

#[test]
fn txt_task_closes_http10_connections() {
    init();
    let hio = Hio::open(256).unwrap();
    let (_htts, addr) = start_server(
        &hio,
        Box::new(|htts, cli, req| htts.dotxt(cli, req, status::OK, None, Some("bye"))),
    );

    let (results, done) = spawn_client(addr, vec![b"GET / HTTP/1.0\r\n\r\n".to_vec()]);
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    let (head, body) = &results[0];
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"bye");
    hio.close();
}

#[test]
fn pipelined_requests_are_buffered_and_replayed() {
    init();
    let hio = Hio::open(256).unwrap();
    let (_htts, addr) = start_server(
        &hio,
        Box::new(|htts, cli, req| {
            let body = req.qpath().to_string();
            htts.dotxt(cli, req, status::OK, None, Some(&body))
        }),
    );

    let results: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let results2 = results.clone();
    let done2 = done.clone();
    std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // Both requests go out in a single write.
        stream
            .write_all(b"GET /a HTTP/1.1\r\nHost: t\r\n\r\nGET /b HTTP/1.1\r\nHost: t\r\n\r\n")
            .unwrap();
        for _ in 0..2 {
            let res = read_one_response(&mut stream);
            results2.lock().unwrap().push(res);
        }
        done2.store(true, Ordering::SeqCst);
    });
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    assert_eq!(results[0].1, b"/a");
    assert_eq!(results[1].1, b"/b");
    hio.close();
}

#[test]
fn file_task_serves_full_and_ranged_reads() {
    init();
    let hio = Hio::open(256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("f.bin"), &payload).unwrap();
    let docroot = dir.path().to_str().unwrap().to_string();

    let (_htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.dofile(cli, req, &docroot, &path, None, 0, None)
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![
            b"GET /f.bin HTTP/1.1\r\nHost: t\r\n\r\n".to_vec(),
            b"GET /f.bin HTTP/1.1\r\nHost: t\r\nRange: bytes=100-199\r\n\r\n".to_vec(),
            b"GET /missing HTTP/1.1\r\nHost: t\r\n\r\n".to_vec(),
        ],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);

    let (head, body) = &results[0];
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Content-Length: 1000\r\n"));
    assert!(head.contains("Accept-Ranges: bytes\r\n"));
    assert!(head.contains("ETag: "));
    assert_eq!(body, &payload);

    let (head, body) = &results[1];
    assert!(
        head.starts_with("HTTP/1.1 206 Partial Content\r\n"),
        "head: {}",
        head
    );
    assert!(head.contains("Content-Length: 100\r\n"));
    assert!(head.contains("Content-Ranges: bytes 100-199/1000\r\n"));
    assert_eq!(body, &payload[100..200]);

    let (head, _) = &results[2];
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {}", head);
    hio.close();
}

#[test]
fn file_task_etag_and_unsatisfiable_range() {
    init();
    let hio = Hio::open(256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("e.txt"), b"etag me").unwrap();
    let docroot = dir.path().to_str().unwrap().to_string();

    let (_htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.dofile(cli, req, &docroot, &path, None, 0, None)
        }),
    );

    // First fetch to learn the entity tag.
    let (results, done) = spawn_client(addr, vec![b"GET /e.txt HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()]);
    serve_until(&hio, || done.load(Ordering::SeqCst));
    let etag = {
        let results = results.lock().unwrap();
        let (head, _) = &results[0];
        head.lines()
            .find_map(|l| l.strip_prefix("ETag: "))
            .unwrap()
            .trim()
            .to_string()
    };

    let conditional = format!(
        "GET /e.txt HTTP/1.1\r\nHost: t\r\nIf-None-Match: {}\r\n\r\n",
        etag
    );
    let bad_range = b"GET /e.txt HTTP/1.1\r\nHost: t\r\nRange: bytes=100-\r\n\r\n".to_vec();
    let (results, done) = spawn_client(addr, vec![conditional.into_bytes(), bad_range]);
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    assert!(
        results[0].0.starts_with("HTTP/1.1 304 Not Modified\r\n"),
        "head: {}",
        results[0].0
    );
    assert!(
        results[1]
            .0
            .starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"),
        "head: {}",
        results[1].0
    );
    hio.close();
}

#[test]
fn file_task_put_then_delete() {
    init();
    let hio = Hio::open(256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let docroot = dir.path().to_str().unwrap().to_string();
    let docroot2 = docroot.clone();

    let (_htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.dofile(cli, req, &docroot2, &path, None, 0, None)
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![
            b"PUT /up.txt HTTP/1.1\r\nHost: t\r\nContent-Length: 8\r\n\r\nuploaded".to_vec(),
            b"DELETE /up.txt HTTP/1.1\r\nHost: t\r\n\r\n".to_vec(),
        ],
    );

    serve_until(&hio, || done.load(Ordering::SeqCst));
    let results = results.lock().unwrap();
    assert!(results[0].0.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", results[0].0);
    assert!(results[1].0.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", results[1].0);
    assert!(!dir.path().join("up.txt").exists());
    hio.close();
}

#[test]
fn method_not_allowed_for_unknown_methods() {
    init();
    let hio = Hio::open(256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let docroot = dir.path().to_str().unwrap().to_string();

    let (_htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.dofile(cli, req, &docroot, &path, None, 0, None)
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![b"TRACE / HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));
    let results = results.lock().unwrap();
    assert!(
        results[0].0.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
        "head: {}",
        results[0].0
    );
    hio.close();
}

#[test]
fn cgi_task_streams_a_chunked_reply() {
    init();
    let hio = Hio::open(256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("hello.cgi");
    std::fs::write(
        &script_path,
        "#!/bin/sh\nprintf 'Status: 200\\r\\nContent-Type: text/plain\\r\\n\\r\\nhello'\n",
    )
    .unwrap();
    let mut perm = std::fs::metadata(&script_path).unwrap().permissions();
    use std::os::unix::fs::PermissionsExt;
    perm.set_mode(0o755);
    std::fs::set_permissions(&script_path, perm).unwrap();
    let docroot = dir.path().to_str().unwrap().to_string();

    let (_htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.docgi(cli, req, &docroot, &path, 0)
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![b"GET /hello.cgi HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    let (head, body) = &results[0];
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Content-Type: text/plain\r\n"));
    // No Content-Length from the script and the connection is reusable,
    // so the reply must be chunk-framed.
    assert!(head.contains("Transfer-Encoding: chunked\r\n"), "head: {}", head);
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, b"hello");
    hio.close();
}

#[test]
fn cgi_concurrency_ceiling_yields_503() {
    init();
    let hio = Hio::open(256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("s.cgi");
    std::fs::write(&script_path, "#!/bin/sh\nprintf 'Status: 200\\r\\n\\r\\n'\n").unwrap();
    use std::os::unix::fs::PermissionsExt;
    let mut perm = std::fs::metadata(&script_path).unwrap().permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(&script_path, perm).unwrap();
    let docroot = dir.path().to_str().unwrap().to_string();

    let (htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.docgi(cli, req, &docroot, &path, 0)
        }),
    );
    htts.set_task_cgi_max(0);

    let (results, done) = spawn_client(
        addr,
        vec![b"GET /s.cgi HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));
    let results = results.lock().unwrap();
    assert!(
        results[0].0.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "head: {}",
        results[0].0
    );
    hio.close();
}

#[test]
fn thr_task_parses_worker_preamble() {
    init();
    let hio = Hio::open(256).unwrap();

    let (_htts, addr) = start_server(
        &hio,
        Box::new(move |htts, cli, req| {
            htts.dothr(
                cli,
                req,
                Box::new(|tfi, mut iop| {
                    let reply = format!(
                        "Status: 200\r\nContent-Type: text/plain\r\n\r\n{} {}",
                        tfi.method_name, tfi.path
                    );
                    iop.write_all(reply.as_bytes()).unwrap();
                    iop.close_write();
                }),
                0,
            )
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![b"GET /work HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    let (head, body) = &results[0];
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert_eq!(body, b"GET /work");
    hio.close();
}

#[test]
fn expectation_other_than_continue_fails() {
    init();
    let hio = Hio::open(256).unwrap();
    let (_htts, addr) = start_server(
        &hio,
        Box::new(|htts, cli, req| htts.dotxt(cli, req, status::OK, None, Some("ok"))),
    );

    let (results, done) = spawn_client(
        addr,
        vec![b"POST / HTTP/1.1\r\nHost: t\r\nContent-Length: 2\r\nExpect: top-speed\r\n\r\nhi"
            .to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));
    let results = results.lock().unwrap();
    assert!(
        results[0].0.starts_with("HTTP/1.1 417 Expectation Failed\r\n"),
        "head: {}",
        results[0].0
    );
    hio.close();
}

#[test]
fn side_channel_adopts_a_preaccepted_connection() {
    init();
    let hio = Hio::open(256).unwrap();

    // A server bound only to the in-process transport.
    let qx_bind = HttsBind::from(SkAd::qx());
    let htts = Htts::start(
        &hio,
        vec![qx_bind],
        Box::new(|htts, cli, req| htts.dotxt(cli, req, status::OK, None, Some("adopted"))),
    )
    .unwrap();

    // Accept the TCP connection outside the loop, then hand the raw
    // handle over through the side channel.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = htts.side_chan_handle(0).unwrap();
    let acceptor = std::thread::spawn(move || {
        use std::os::unix::io::IntoRawFd;
        let (conn, peer) = listener.accept().unwrap();
        let msg = hio::sck::QxMsg::newconn(
            hio::sck::SckType::Tcp4,
            conn.into_raw_fd(),
            SkAd::from(peer),
        );
        handle.write(msg.as_bytes()).unwrap();
    });

    let (results, done) = spawn_client(
        addr,
        vec![b"GET / HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));
    acceptor.join().unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results[0].1, b"adopted");
    hio.close();
}

#[test]
fn request_path_decoding_feeds_the_dispatcher() {
    init();
    let hio = Hio::open(256).unwrap();
    let (_htts, addr) = start_server(
        &hio,
        Box::new(|htts, cli, req| {
            let decoded = req.perdec_qpath().to_string();
            let merged = http::merge_paths("/srv", &decoded);
            htts.dotxt(cli, req, status::OK, None, Some(&merged))
        }),
    );

    let (results, done) = spawn_client(
        addr,
        vec![b"GET /a%20b/../c?x=%31 HTTP/1.1\r\nHost: t\r\n\r\n".to_vec()],
    );
    serve_until(&hio, || done.load(Ordering::SeqCst));
    let results = results.lock().unwrap();
    assert_eq!(results[0].1, b"/srv/c");
    hio.close();
}
