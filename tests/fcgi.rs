//! The FastCGI task against a minimal in-test responder speaking record
//! protocol version 1.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hio::http::svr::{Htts, HttsBind};
use hio::{Hio, SkAd};

mod util;
use util::{init, read_one_response, send_request, serve_until};

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;

fn read_record(stream: &mut TcpStream) -> Option<(u8, u16, Vec<u8>)> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).ok()?;
    assert_eq!(head[0], 1, "record version");
    let typ = head[1];
    let id = u16::from_be_bytes([head[2], head[3]]);
    let clen = u16::from_be_bytes([head[4], head[5]]) as usize;
    let plen = head[6] as usize;
    let mut content = vec![0u8; clen + plen];
    stream.read_exact(&mut content).ok()?;
    content.truncate(clen);
    Some((typ, id, content))
}

fn write_record(stream: &mut TcpStream, typ: u8, id: u16, content: &[u8]) {
    let mut rec = Vec::with_capacity(8 + content.len());
    rec.push(1);
    rec.push(typ);
    rec.extend_from_slice(&id.to_be_bytes());
    rec.extend_from_slice(&(content.len() as u16).to_be_bytes());
    rec.push(0);
    rec.push(0);
    rec.extend_from_slice(content);
    stream.write_all(&rec).unwrap();
}

/// Accepts one connection and answers one RESPONDER request with a
/// CGI-style reply. Collects the parameter bytes for inspection.
fn spawn_responder(listener: TcpListener) -> Arc<Mutex<Vec<u8>>> {
    let params: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let params2 = params.clone();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut req_id = 0u16;
        let mut begun = false;
        while let Some((typ, id, content)) = read_record(&mut stream) {
            match typ {
                FCGI_BEGIN_REQUEST => {
                    assert_eq!(u16::from_be_bytes([content[0], content[1]]), 1, "role");
                    req_id = id;
                    begun = true;
                }
                FCGI_PARAMS => {
                    params2.lock().unwrap().extend_from_slice(&content);
                }
                FCGI_STDIN if content.is_empty() => {
                    assert!(begun);
                    write_record(
                        &mut stream,
                        FCGI_STDOUT,
                        req_id,
                        b"Status: 200\r\nContent-Type: text/plain\r\n\r\nfcgi-ok",
                    );
                    write_record(&mut stream, FCGI_STDOUT, req_id, b"");
                    write_record(&mut stream, FCGI_END_REQUEST, req_id, &[0, 0, 0, 0, 0, 0, 0, 0]);
                }
                _ => {}
            }
        }
    });
    params
}

#[test]
fn fcgi_task_round_trip() {
    init();
    let hio = Hio::open(256).unwrap();

    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let params = spawn_responder(upstream);

    let bind = HttsBind::from(SkAd::from(
        "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap(),
    ));
    let htts = Htts::start(
        &hio,
        vec![bind],
        Box::new(move |htts, cli, req| {
            let path = req.perdec_qpath().to_string();
            htts.dofcgi(cli, req, &SkAd::from(upstream_addr), "/srv", &path)
        }),
    )
    .unwrap();
    htts.enable_fcgic().unwrap();
    let addr = htts.getsockaddr(0).unwrap().to_socket_addr().unwrap();

    let results: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let results2 = results.clone();
    let done2 = done.clone();
    std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        send_request(&mut stream, b"GET /app?x=1 HTTP/1.1\r\nHost: t\r\n\r\n");
        let res = read_one_response(&mut stream);
        results2.lock().unwrap().push(res);
        done2.store(true, Ordering::SeqCst);
    });

    serve_until(&hio, || done.load(Ordering::SeqCst));

    let results = results.lock().unwrap();
    let (head, body) = &results[0];
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Content-Type: text/plain\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert_eq!(body, b"fcgi-ok");

    // The parameter stream carried the request essentials.
    let params = params.lock().unwrap();
    let blob = String::from_utf8_lossy(&params);
    assert!(blob.contains("REQUEST_METHOD"));
    assert!(blob.contains("SCRIPT_FILENAME"));
    assert!(blob.contains("QUERY_STRING"));
    hio.close();
}
