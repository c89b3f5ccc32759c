//! A minimal in-process memcached server, speaking just enough of the
//! binary protocol to drive the integration tests: `get`/`getq`/`set`/
//! `add`/`replace`/`delete`/`incr`/`decr`/`touch`/`gat`/`noop`/`version`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

#[derive(Clone)]
struct Item {
    flags: u32,
    value: Vec<u8>,
    cas: u64,
}

type Store = Arc<AsyncMutex<HashMap<Vec<u8>, Item>>>;

static CAS_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct MockServer {
    pub addr: SocketAddr,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let store: Store = Arc::new(AsyncMutex::new(HashMap::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted { Ok(v) => v, Err(_) => continue };
                        let store = store.clone();
                        tokio::spawn(handle_connection(stream, store));
                    }
                }
            }
        });

        MockServer { addr, stop: Some(stop_tx) }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.addr.port())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

struct Header {
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    total_body_len: usize,
    opaque: u32,
    cas: u64,
}

async fn read_header(stream: &mut TcpStream) -> Option<Header> {
    let mut buf = [0u8; 24];
    if stream.read_exact(&mut buf).await.is_err() {
        return None;
    }
    if buf[0] != MAGIC_REQUEST {
        return None;
    }
    Some(Header {
        opcode: buf[1],
        key_len: u16::from_be_bytes([buf[2], buf[3]]) as usize,
        extras_len: buf[4] as usize,
        total_body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize,
        opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        cas: u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]),
    })
}

fn encode_response(opcode: u8, status: u16, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    let body_len = extras.len() + key.len() + value.len();
    let mut out = Vec::with_capacity(24 + body_len);
    out.push(MAGIC_RESPONSE);
    out.push(opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

async fn handle_connection(mut stream: TcpStream, store: Store) {
    const GET: u8 = 0x00;
    const SET: u8 = 0x01;
    const ADD: u8 = 0x02;
    const REPLACE: u8 = 0x03;
    const DELETE: u8 = 0x04;
    const INCREMENT: u8 = 0x05;
    const DECREMENT: u8 = 0x06;
    const QUIT: u8 = 0x07;
    const GETQ: u8 = 0x09;
    const NOOP: u8 = 0x0A;
    const VERSION: u8 = 0x0B;
    const STAT: u8 = 0x10;
    const SETQ: u8 = 0x11;
    const DELETEQ: u8 = 0x14;
    const TOUCH: u8 = 0x1C;
    const GAT: u8 = 0x1D;

    loop {
        let header = match read_header(&mut stream).await {
            Some(h) => h,
            None => return,
        };
        let mut body = vec![0u8; header.total_body_len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let extras = &body[..header.extras_len];
        let key = &body[header.extras_len..header.extras_len + header.key_len];
        let value = &body[header.extras_len + header.key_len..];

        match header.opcode {
            GET | GETQ => {
                let found = store.lock().await.get(key).cloned();
                match found {
                    Some(item) => {
                        let resp = encode_response(
                            header.opcode,
                            0,
                            header.opaque,
                            item.cas,
                            &item.flags.to_be_bytes(),
                            &[],
                            &item.value,
                        );
                        let _ = stream.write_all(&resp).await;
                    }
                    None => {
                        if header.opcode == GET {
                            let resp = encode_response(header.opcode, 0x0001, header.opaque, 0, &[], &[], &[]);
                            let _ = stream.write_all(&resp).await;
                        }
                        // GETQ: silent miss, no response.
                    }
                }
            }
            SET | ADD | REPLACE | SETQ => {
                let quiet = header.opcode == SETQ;
                let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
                let mut store = store.lock().await;
                let exists = store.contains_key(key);
                if header.opcode == ADD && exists {
                    drop(store);
                    let resp = encode_response(header.opcode, 0x0002, header.opaque, 0, &[], &[], &[]);
                    let _ = stream.write_all(&resp).await;
                    continue;
                }
                if header.opcode == REPLACE && !exists {
                    drop(store);
                    let resp = encode_response(header.opcode, 0x0005, header.opaque, 0, &[], &[], &[]);
                    let _ = stream.write_all(&resp).await;
                    continue;
                }
                if header.cas != 0 {
                    if let Some(current) = store.get(key) {
                        if current.cas != header.cas {
                            drop(store);
                            let resp = encode_response(header.opcode, 0x0002, header.opaque, 0, &[], &[], &[]);
                            let _ = stream.write_all(&resp).await;
                            continue;
                        }
                    }
                }
                let cas = CAS_SEQ.fetch_add(1, Ordering::Relaxed);
                store.insert(
                    key.to_vec(),
                    Item {
                        flags,
                        value: value.to_vec(),
                        cas,
                    },
                );
                drop(store);
                if !quiet {
                    let resp = encode_response(header.opcode, 0, header.opaque, cas, &[], &[], &[]);
                    let _ = stream.write_all(&resp).await;
                }
            }
            DELETE | DELETEQ => {
                let quiet = header.opcode == DELETEQ;
                let removed = store.lock().await.remove(key).is_some();
                let status: u16 = if removed { 0 } else { 0x0001 };
                if !quiet || status != 0 {
                    let resp = encode_response(header.opcode, status, header.opaque, 0, &[], &[], &[]);
                    let _ = stream.write_all(&resp).await;
                }
            }
            INCREMENT | DECREMENT => {
                let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap());
                let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
                let mut store = store.lock().await;
                let current = store.get(key).and_then(|i| {
                    std::str::from_utf8(&i.value).ok()?.parse::<u64>().ok()
                });
                let next = match current {
                    Some(v) if header.opcode == INCREMENT => v.saturating_add(delta),
                    Some(v) => v.saturating_sub(delta),
                    None => initial,
                };
                let cas = CAS_SEQ.fetch_add(1, Ordering::Relaxed);
                store.insert(
                    key.to_vec(),
                    Item {
                        flags: 0,
                        value: next.to_string().into_bytes(),
                        cas,
                    },
                );
                drop(store);
                let resp = encode_response(header.opcode, 0, header.opaque, cas, &[], &[], &next.to_be_bytes());
                let _ = stream.write_all(&resp).await;
            }
            TOUCH => {
                let exists = store.lock().await.contains_key(key);
                let status: u16 = if exists { 0 } else { 0x0001 };
                let resp = encode_response(header.opcode, status, header.opaque, 0, &[], &[], &[]);
                let _ = stream.write_all(&resp).await;
            }
            GAT => {
                let found = store.lock().await.get(key).cloned();
                match found {
                    Some(item) => {
                        let resp = encode_response(
                            header.opcode,
                            0,
                            header.opaque,
                            item.cas,
                            &item.flags.to_be_bytes(),
                            &[],
                            &item.value,
                        );
                        let _ = stream.write_all(&resp).await;
                    }
                    None => {
                        let resp = encode_response(header.opcode, 0x0001, header.opaque, 0, &[], &[], &[]);
                        let _ = stream.write_all(&resp).await;
                    }
                }
            }
            NOOP => {
                let resp = encode_response(header.opcode, 0, header.opaque, 0, &[], &[], &[]);
                let _ = stream.write_all(&resp).await;
            }
            VERSION => {
                let resp = encode_response(header.opcode, 0, header.opaque, 0, &[], &[], b"mock-1.0.0");
                let _ = stream.write_all(&resp).await;
            }
            STAT => {
                let pid = encode_response(header.opcode, 0, header.opaque, 0, &[], b"pid", b"1");
                let _ = stream.write_all(&pid).await;
                let terminator = encode_response(header.opcode, 0, header.opaque, 0, &[], &[], &[]);
                let _ = stream.write_all(&terminator).await;
            }
            QUIT => return,
            _ => {
                let resp = encode_response(header.opcode, 0x0081, header.opaque, 0, &[], &[], &[]);
                let _ = stream.write_all(&resp).await;
            }
        }
    }
}

/// A listener that accepts TCP connections only to immediately drop them,
/// simulating a server that is down but whose port is unreachable-refused
/// rather than merely slow.
pub async fn dead_port() -> SocketAddr {
    // bind and immediately drop: the OS will refuse connections to this
    // now-closed port, which is the easiest reliable way to simulate an
    // unreachable server in a test.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
