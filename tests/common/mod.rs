//! a scripted in-memory backend. tests drive the adapter against a duplex
//! stream and answer the frontend protocol by hand.

#![allow(dead_code)]

use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use postgres_pipeline::{
    transport::{Connect, Io},
    Adapter, BoxedFuture, Config, Error,
};

/// hands out pre-created duplex streams, one per (re)connection.
pub struct TestConnector {
    streams: Mutex<Vec<DuplexStream>>,
}

impl TestConnector {
    pub fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams),
        }
    }
}

impl Connect for TestConnector {
    fn connect<'a>(&'a self, _cfg: &'a Config) -> BoxedFuture<'a, Result<Box<dyn Io>, Error>> {
        Box::pin(async move {
            let mut streams = self.streams.lock().unwrap();
            assert!(!streams.is_empty(), "no scripted connection left");
            Ok(Box::new(streams.remove(0)) as Box<dyn Io>)
        })
    }
}

/// server side of the duplex stream.
pub struct MockBackend {
    io: DuplexStream,
}

impl MockBackend {
    pub fn new(io: DuplexStream) -> Self {
        Self { io }
    }

    /// consume the startup message and answer with a successful handshake.
    pub async fn handshake(&mut self) {
        let len = self.io.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.io.read_exact(&mut body).await.unwrap();

        self.send(&[
            auth_ok(),
            parameter_status("server_version", "16.3"),
            backend_key_data(42, 1234),
            ready(b'I'),
        ])
        .await;
    }

    /// read one frontend message.
    pub async fn recv(&mut self) -> (u8, Vec<u8>) {
        let tag = self.io.read_u8().await.unwrap();
        let len = self.io.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    /// read frontend messages up to and including the next Sync.
    pub async fn recv_until_sync(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut msgs = Vec::new();
        loop {
            let msg = self.recv().await;
            let done = msg.0 == b'S';
            msgs.push(msg);
            if done {
                return msgs;
            }
        }
    }

    pub async fn send(&mut self, msgs: &[Vec<u8>]) {
        let bytes: Vec<u8> = msgs.iter().flatten().copied().collect();
        self.io.write_all(&bytes).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// close the backend side of the stream.
    pub fn shutdown(self) {}
}

/// connect an adapter to a fresh mock backend, running the handshake.
pub async fn connect(cfg: &str) -> (Adapter, MockBackend) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);

    let connect = Adapter::builder(cfg)
        .connector(TestConnector::new(vec![client_io]))
        .connect();
    let server = async {
        let mut backend = MockBackend::new(server_io);
        backend.handshake().await;
        backend
    };

    let (adapter, backend) = tokio::join!(connect, server);
    (adapter.unwrap(), backend)
}

pub async fn connect_default() -> (Adapter, MockBackend) {
    connect("user=tester dbname=app").await
}

// ----------------------------------------------------------------------
// backend message encoding
// ----------------------------------------------------------------------

pub fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(body);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

pub fn auth_ok() -> Vec<u8> {
    msg(b'R', &0i32.to_be_bytes())
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = cstr(name);
    body.extend(cstr(value));
    msg(b'S', &body)
}

pub fn backend_key_data(pid: i32, key: i32) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend(key.to_be_bytes());
    msg(b'K', &body)
}

pub fn ready(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

pub fn parse_complete() -> Vec<u8> {
    msg(b'1', &[])
}

pub fn bind_complete() -> Vec<u8> {
    msg(b'2', &[])
}

pub fn close_complete() -> Vec<u8> {
    msg(b'3', &[])
}

pub fn no_data() -> Vec<u8> {
    msg(b'n', &[])
}

pub fn empty_query_response() -> Vec<u8> {
    msg(b'I', &[])
}

pub fn parameter_description(oids: &[u32]) -> Vec<u8> {
    let mut body = (oids.len() as i16).to_be_bytes().to_vec();
    for oid in oids {
        body.extend(oid.to_be_bytes());
    }
    msg(b't', &body)
}

pub fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
    let mut body = (columns.len() as i16).to_be_bytes().to_vec();
    for (name, oid) in columns {
        body.extend(cstr(name));
        body.extend(0i32.to_be_bytes()); // table oid
        body.extend(0i16.to_be_bytes()); // column attribute number
        body.extend(oid.to_be_bytes());
        body.extend((-1i16).to_be_bytes()); // type length
        body.extend((-1i32).to_be_bytes()); // type modifier
        body.extend(0i16.to_be_bytes()); // format
    }
    msg(b'T', &body)
}

pub fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        match value {
            Some(value) => {
                body.extend((value.len() as i32).to_be_bytes());
                body.extend_from_slice(value);
            }
            None => body.extend((-1i32).to_be_bytes()),
        }
    }
    msg(b'D', &body)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    msg(b'C', &cstr(tag))
}

pub fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [
        (b'S', "ERROR"),
        (b'V', "ERROR"),
        (b'C', code),
        (b'M', message),
    ] {
        body.push(field);
        body.extend(cstr(value));
    }
    body.push(0);
    msg(b'E', &body)
}

/// big-endian int4, the binary encoding for oid 23.
pub fn int4(v: i32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

// ----------------------------------------------------------------------
// frontend message inspection
// ----------------------------------------------------------------------

/// statement name of a Parse message.
pub fn parse_statement_name(body: &[u8]) -> String {
    read_cstr(body)
}

/// statement name of a Bind message (second c-string, after the portal).
pub fn bind_statement_name(body: &[u8]) -> String {
    let portal = read_cstr(body);
    read_cstr(&body[portal.len() + 1..])
}

/// statement name of a Close message (after the 'S'/'P' kind byte).
pub fn close_statement_name(body: &[u8]) -> String {
    read_cstr(&body[1..])
}

/// statement text of a simple Query message.
pub fn query_text(body: &[u8]) -> String {
    read_cstr(body)
}

fn read_cstr(body: &[u8]) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap();
    String::from_utf8_lossy(&body[..end]).into_owned()
}
