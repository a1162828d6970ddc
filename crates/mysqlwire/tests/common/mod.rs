//! A scripted MySQL server on a loopback socket.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use asupersync::Outcome;
use asupersync::runtime::RuntimeBuilder;

use mysqlwire::Error;

pub const SCRAMBLE: &[u8; 20] = b"ABCD1234efgh5678ijkl";
pub const SERVER_CAPS: u32 = 0x807F_F7FF;

pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Accept one client and run `script` against it on a thread.
pub fn spawn_server<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(&mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept client");
        script(&mut stream);
    });
    (addr, handle)
}

pub fn write_packet(stream: &mut TcpStream, sequence_id: u8, payload: &[u8]) {
    let len = payload.len() as u32;
    let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, sequence_id];
    stream.write_all(&header).expect("write header");
    stream.write_all(payload).expect("write payload");
    stream.flush().expect("flush");
}

/// Read one packet; `None` once the client has closed the socket.
pub fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).ok()?;
    let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).ok()?;
    Some((header[3], payload))
}

pub fn greeting(thread_id: u32) -> Vec<u8> {
    let mut payload = vec![10];
    payload.extend_from_slice(b"8.0.36\0");
    payload.extend_from_slice(&thread_id.to_le_bytes());
    payload.extend_from_slice(&SCRAMBLE[..8]);
    payload.push(0);
    payload.extend_from_slice(&((SERVER_CAPS & 0xFFFF) as u16).to_le_bytes());
    payload.push(33);
    payload.extend_from_slice(&0x0002u16.to_le_bytes());
    payload.extend_from_slice(&((SERVER_CAPS >> 16) as u16).to_le_bytes());
    payload.push(21);
    payload.extend_from_slice(&[0; 10]);
    payload.extend_from_slice(&SCRAMBLE[8..]);
    payload.push(0);
    payload.extend_from_slice(b"mysql_native_password\0");
    payload
}

pub fn ok_packet(affected_rows: u8) -> Vec<u8> {
    vec![0x00, affected_rows, 0x00, 0x02, 0x00, 0x00, 0x00]
}

pub fn err_packet(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut payload = vec![0xFF];
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(sql_state.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    payload
}

pub fn eof_packet() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

fn lenenc_str(out: &mut Vec<u8>, s: &str) {
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

pub fn column_packet(name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for part in ["def", "", "", "", name, ""] {
        lenenc_str(&mut payload, part);
    }
    payload.push(0x0c);
    payload.extend_from_slice(&63u16.to_le_bytes());
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload.push(0x08);
    payload.extend_from_slice(&0x0081u16.to_le_bytes());
    payload.push(0);
    payload.extend_from_slice(&[0, 0]);
    payload
}

pub fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut payload = Vec::new();
    for value in values {
        match value {
            Some(v) => lenenc_str(&mut payload, v),
            None => payload.push(0xFB),
        }
    }
    payload
}

/// User name and token from a protocol 4.1 credentials payload.
pub fn parse_credentials(payload: &[u8]) -> (String, Vec<u8>) {
    let rest = &payload[32..];
    let nul = rest.iter().position(|&b| b == 0).expect("user terminator");
    let user = String::from_utf8(rest[..nul].to_vec()).expect("utf-8 user");
    let token_len = usize::from(rest[nul + 1]);
    let token = rest[nul + 2..nul + 2 + token_len].to_vec();
    (user, token)
}
