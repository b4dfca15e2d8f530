#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use hio::Hio;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialize the logger");
    });
}

/// Drives the loop until `done` reports completion, with a hard deadline
/// so a wedged test fails instead of hanging.
pub fn serve_until<F: FnMut() -> bool>(hio: &Rc<Hio>, mut done: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "test timed out");
        hio.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

/// Reads exactly one HTTP response off the stream: the head up to the
/// blank line, then a body framed by `Content-Length` or chunked
/// transfer-encoding. Returns `(head, body)`.
pub fn read_one_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).unwrap();
        assert!(n > 0, "eof before response head completed");
        if line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }

    let mut body = Vec::new();
    let lower = head.to_ascii_lowercase();
    if let Some(pos) = lower.find("content-length:") {
        let len: usize = lower[pos + 15..]
            .lines()
            .next()
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        body.resize(len, 0);
        reader.read_exact(&mut body).unwrap();
    } else if lower.contains("transfer-encoding: chunked") {
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let size = usize::from_str_radix(line.trim(), 16).unwrap();
            if size == 0 {
                let mut crlf = String::new();
                reader.read_line(&mut crlf).unwrap();
                break;
            }
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            assert_eq!(&chunk[size..], b"\r\n");
            body.extend_from_slice(&chunk[..size]);
        }
    } else {
        // Close-delimited.
        reader.read_to_end(&mut body).unwrap();
    }
    (head, body)
}

/// Writes a whole request buffer.
pub fn send_request(stream: &mut TcpStream, req: &[u8]) {
    stream.write_all(req).unwrap();
    stream.flush().unwrap();
}
