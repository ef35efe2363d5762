//! end-to-end loopback test: a hand-rolled TCP server that performs the
//! RFC 6455 handshake and echoes back whatever text frame it receives,
//! exercising the full connect/send/recv/close path against a real socket
//! rather than an in-memory buffer.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use ws_client::connection::{ClientConfig, Connection, Event};

fn accept_key(key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// read the client's HTTP upgrade request off `stream`, reply with a 101,
/// then read one client frame and echo its payload back unmasked as a
/// server text frame, finally replying to a CLOSE with a CLOSE of its own.
fn run_echo_server(listener: TcpListener) {
    let (mut stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        request.push(byte[0]);
        if request.len() >= 4 && &request[request.len() - 4..] == b"\r\n\r\n" {
            break;
        }
    }
    let request_str = String::from_utf8_lossy(&request);
    let key_line = request_str
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("sec-websocket-key"))
        .unwrap();
    let key = key_line.split(':').nth(1).unwrap().trim();
    let accept = accept_key(key);

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).unwrap();

    loop {
        let mut header = [0u8; 2];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        let masked = header[1] & 0x80 != 0;
        let mut len = (header[1] & 0x7F) as u64;
        if len == 126 {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            len = u16::from_be_bytes(ext) as u64;
        } else if len == 127 {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            len = u64::from_be_bytes(ext);
        }
        let mut mask_key = [0u8; 4];
        if masked {
            stream.read_exact(&mut mask_key).unwrap();
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).unwrap();
        if masked {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= mask_key[i % 4];
            }
        }

        assert!(fin, "test only sends unfragmented frames");

        match opcode {
            0x1 => {
                // echo back as an unmasked server text frame
                let mut out = vec![0x81u8, payload.len() as u8];
                out.extend_from_slice(&payload);
                stream.write_all(&out).unwrap();
            }
            0x8 => {
                let mut out = vec![0x88u8, payload.len() as u8];
                out.extend_from_slice(&payload);
                stream.write_all(&out).unwrap();
                return;
            }
            0x9 => {
                let mut out = vec![0x8Au8, payload.len() as u8];
                out.extend_from_slice(&payload);
                stream.write_all(&out).unwrap();
            }
            _ => {}
        }
    }
}

#[test]
fn connects_sends_and_receives_an_echoed_text_message() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || run_echo_server(listener));

    let url = format!("ws://{}/echo", addr);
    let mut config = ClientConfig::default();
    config.read_timeout = Some(Duration::from_secs(5));
    let mut conn = Connection::connect(&url, &config).expect("handshake should succeed");

    conn.send_text("hello from the loopback test").unwrap();
    let event = conn.recv().unwrap();
    assert_eq!(
        event,
        Event::Text("hello from the loopback test".to_string())
    );

    conn.close(1000, "done").unwrap();
    server.join().unwrap();
}

#[test]
fn ping_is_answered_with_a_pong_from_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || run_echo_server(listener));

    let url = format!("ws://{}/echo", addr);
    let mut config = ClientConfig::default();
    config.read_timeout = Some(Duration::from_secs(5));
    let mut conn = Connection::connect(&url, &config).expect("handshake should succeed");

    conn.send_ping(b"are you there".to_vec()).unwrap();
    let event = conn.recv().unwrap();
    assert_eq!(event, Event::Pong(b"are you there".to_vec()));

    conn.close(1000, "done").unwrap();
    server.join().unwrap();
}
