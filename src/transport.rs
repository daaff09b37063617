//! socket transport. frames backend messages out of a read buffer and batches
//! frontend messages into a write buffer that is flushed per request.

use bytes::BytesMut;
use postgres_protocol::message::backend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    config::{Config, Host},
    error::{unexpected_eof_err, ConfigError, Error},
    BoxedFuture,
};

/// stream types the adapter can run on. implemented for everything that is
/// async readable and writable, notably [tokio::net::TcpStream] and the
/// in-memory duplex stream used by tests.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// supplies the stream a connection (or reconnection) runs on.
pub trait Connect: Send + Sync {
    fn connect<'a>(&'a self, cfg: &'a Config) -> BoxedFuture<'a, Result<Box<dyn Io>, Error>>;
}

/// default connector. dials the configured hosts in order over TCP (or a unix
/// socket path) and returns the first stream that answers.
pub struct Connector;

impl Connect for Connector {
    fn connect<'a>(&'a self, cfg: &'a Config) -> BoxedFuture<'a, Result<Box<dyn Io>, Error>> {
        Box::pin(async move {
            let hosts = cfg.get_hosts();
            if hosts.is_empty() {
                return Err(ConfigError("no host configured".into()).into());
            }

            let mut err = None;

            for (idx, host) in hosts.iter().enumerate() {
                let port = port_for(cfg.get_ports(), idx, hosts.len())?;
                match dial(host, port).await {
                    Ok(io) => return Ok(io),
                    Err(e) => err = Some(e),
                }
            }

            Err(err.unwrap_or_else(|| ConfigError("no host configured".into()).into()))
        })
    }
}

fn port_for(ports: &[u16], idx: usize, hosts: usize) -> Result<u16, Error> {
    match ports.len() {
        0 => Ok(5432),
        1 => Ok(ports[0]),
        n if n == hosts => Ok(ports[idx]),
        _ => Err(ConfigError("port count must be zero, one, or match host count".into()).into()),
    }
}

async fn dial(host: &Host, port: u16) -> Result<Box<dyn Io>, Error> {
    match host {
        Host::Tcp(host) => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Host::Unix(path) => {
            let path = path.join(format!(".s.PGSQL.{port}"));
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Host::Unix(_) => Err(ConfigError("unix sockets are not supported on this platform".into()).into()),
    }
}

pub(crate) struct Transport {
    io: Box<dyn Io>,
    read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
}

impl Transport {
    pub(crate) fn new(io: Box<dyn Io>) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    /// flush everything batched in the write buffer to the socket.
    pub(crate) async fn send(&mut self) -> Result<(), Error> {
        let buf = self.write_buf.split();
        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// read the next backend message. blocks until a whole message is buffered.
    pub(crate) async fn recv(&mut self) -> Result<backend::Message, Error> {
        loop {
            if let Some(msg) = backend::Message::parse(&mut self.read_buf)? {
                return Ok(msg);
            }
            if self.io.read_buf(&mut self.read_buf).await? == 0 {
                return Err(unexpected_eof_err().into());
            }
        }
    }
}
