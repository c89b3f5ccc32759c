//! One logical duplex connection to a server: a TCP stream plus the opaque
//! counter and read/write buffers needed to frame and correlate requests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use cachemux_core::{Poolable, ResourceFactory};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::Server;
use crate::error::Error;
use crate::protocol::{try_decode_response, Opcode, RequestFrame, ResponseFrame};

const READ_CHUNK: usize = 8192;

/// A pooled TCP connection to one server.
pub struct Connection {
    server: Server,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    opaque_counter: AtomicU32,
    healthy: Arc<AtomicBool>,
}

impl Connection {
    async fn connect(server: Server, connect_timeout: Option<Duration>) -> Result<Self, Error> {
        let addr = format!("{}:{}", server.host, server.port);
        let stream = match connect_timeout {
            Some(d) => timeout(d, TcpStream::connect(&addr))
                .await
                .map_err(|_| Error::Timeout)??,
            None => TcpStream::connect(&addr).await?,
        };
        stream.set_nodelay(true)?;
        debug!(server = %server, "connected");
        Ok(Connection {
            server,
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            opaque_counter: AtomicU32::new(1),
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// A process-unique-per-connection correlation id for the next request.
    pub fn next_opaque(&self) -> u32 {
        self.opaque_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    async fn write_frame(&mut self, frame: &RequestFrame) -> Result<(), Error> {
        self.write_buf.clear();
        frame.encode(&mut self.write_buf);
        let res = self.stream.write_all(&self.write_buf).await;
        if res.is_err() {
            self.mark_unhealthy();
        }
        Ok(res?)
    }

    async fn read_one(&mut self) -> Result<ResponseFrame, Error> {
        loop {
            if let Some(frame) = try_decode_response(&mut self.read_buf).map_err(|e| {
                self.mark_unhealthy();
                e
            })? {
                trace!(opcode = ?frame.opcode, opaque = frame.opaque, "decoded response");
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await.map_err(|e| {
                self.mark_unhealthy();
                e
            })?;
            if n == 0 {
                self.mark_unhealthy();
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write one request and read back its matching response. The write and
    /// the wait for a response are bounded independently: a slow write and a
    /// slow response are distinct failure modes with their own budgets.
    pub async fn roundtrip(
        &mut self,
        frame: &RequestFrame,
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> Result<ResponseFrame, Error> {
        self.roundtrip_no_read(frame, write_timeout).await?;
        self.read_response(response_timeout).await
    }

    /// Write one request without waiting for a response, for multi-response
    /// commands like `stat` that reply with a variable number of frames.
    pub async fn roundtrip_no_read(
        &mut self,
        frame: &RequestFrame,
        deadline: Option<Duration>,
    ) -> Result<(), Error> {
        match deadline {
            Some(d) => timeout(d, self.write_frame(frame)).await.map_err(|_| {
                self.mark_unhealthy();
                Error::Timeout
            })?,
            None => self.write_frame(frame).await,
        }
    }

    /// Read back a single response frame, subject to `deadline`.
    pub async fn read_response(&mut self, deadline: Option<Duration>) -> Result<ResponseFrame, Error> {
        match deadline {
            Some(d) => timeout(d, self.read_one()).await.map_err(|_| {
                self.mark_unhealthy();
                Error::Timeout
            })?,
            None => self.read_one().await,
        }
    }

    /// Write a batch of quiet requests terminated by a NOOP, then read
    /// responses (keyed by opaque) until the NOOP's reply is observed. The
    /// write and the read-until-NOOP phases are bounded independently.
    /// Orphaned in-flight entries on timeout taint the connection so it is
    /// never returned to the pool.
    pub async fn send_quiet_batch(
        &mut self,
        requests: &[RequestFrame],
        noop_opaque: u32,
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> Result<std::collections::HashMap<u32, ResponseFrame>, Error> {
        let write_fut = async {
            self.write_buf.clear();
            self.write_buf.reserve(READ_CHUNK);
            for req in requests {
                req.encode(&mut self.write_buf);
            }
            let noop = RequestFrame::new(Opcode::NoOp, noop_opaque);
            noop.encode(&mut self.write_buf);
            let res = self.stream.write_all(&self.write_buf).await;
            if res.is_err() {
                self.mark_unhealthy();
            }
            res.map_err(Error::from)
        };
        match write_timeout {
            Some(d) => timeout(d, write_fut).await.map_err(|_| {
                self.mark_unhealthy();
                Error::Timeout
            })??,
            None => write_fut.await?,
        }

        let read_fut = async {
            let mut out = std::collections::HashMap::with_capacity(requests.len());
            loop {
                let frame = self.read_one().await?;
                if frame.opaque == noop_opaque {
                    return Ok(out);
                }
                out.insert(frame.opaque, frame);
            }
        };
        match response_timeout {
            Some(d) => timeout(d, read_fut).await.map_err(|_| {
                self.mark_unhealthy();
                Error::Timeout
            })?,
            None => read_fut.await,
        }
    }

    /// Health-monitor probe: a `version` request/response round trip.
    pub async fn probe_version(&mut self, deadline: Duration) -> Result<String, Error> {
        let opaque = self.next_opaque();
        let req = RequestFrame::new(Opcode::Version, opaque);
        let resp = self.roundtrip(&req, Some(deadline), Some(deadline)).await?;
        if !resp.is_success() {
            return Err(Error::ServerStatus(resp.status()?));
        }
        Ok(String::from_utf8_lossy(&resp.value).into_owned())
    }

    /// Best-effort graceful close; does not wait for a response (`quit` has
    /// no reply).
    pub async fn quit(&mut self) {
        let opaque = self.next_opaque();
        let req = RequestFrame::new(Opcode::Quit, opaque);
        let _ = self.write_frame(&req).await;
    }
}

impl Poolable for Connection {
    fn is_open(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Creates, validates, and destroys `Connection`s for the keyed pool.
pub struct ConnectionFactory {
    connect_timeout: Option<Duration>,
}

impl ConnectionFactory {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        ConnectionFactory { connect_timeout }
    }
}

impl ResourceFactory<Server, Connection> for ConnectionFactory {
    type Error = Error;

    async fn create(&self, key: &Server) -> Result<Connection, Error> {
        Connection::connect(key.clone(), self.connect_timeout).await
    }

    async fn validate(&self, _key: &Server, value: &mut Connection) -> Result<(), Error> {
        if value.is_open() {
            Ok(())
        } else {
            Err(Error::NoValidObject)
        }
    }

    fn destroy(&self, key: &Server, _value: Connection) {
        warn!(server = %key, "connection destroyed");
    }
}
