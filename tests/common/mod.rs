//! A minimal in-process PostgreSQL backend for pool tests: accepts v3
//! startup, answers simple and extended protocol messages with canned
//! responses, and records the cancel requests it receives.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const STARTUP_CODE: i32 = 196608;
pub const CANCEL_CODE: i32 = 80877102;

#[derive(Default)]
pub struct BackendState {
    /// (process_id, secret_key) pairs seen in CancelRequest packets.
    pub cancel_requests: Mutex<Vec<(i32, i32)>>,
    /// Backend pids handed out, in order.
    pub sessions: Mutex<Vec<i32>>,
    next_pid: AtomicI32,
}

pub struct FakeBackend {
    pub port: u16,
    pub state: Arc<BackendState>,
}

impl FakeBackend {
    /// Bind a listener on a free port and serve connections forever.
    pub async fn start() -> FakeBackend {
        let port = portpicker::pick_unused_port().expect("no free port");
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let state = Arc::new(BackendState {
            next_pid: AtomicI32::new(1000),
            ..Default::default()
        });

        let shared = state.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, state).await;
                });
            }
        });

        FakeBackend { port, state }
    }
}

async fn serve_connection(mut socket: TcpStream, state: Arc<BackendState>) -> std::io::Result<()> {
    // Startup packet: length + code + payload.
    let len = socket.read_i32().await?;
    let mut payload = vec![0u8; (len - 4) as usize];
    socket.read_exact(&mut payload).await?;
    let mut cursor = BytesMut::from(&payload[..]);
    let code = cursor.get_i32();

    if code == CANCEL_CODE {
        let process_id = cursor.get_i32();
        let secret_key = cursor.get_i32();
        state.cancel_requests.lock().push((process_id, secret_key));
        return Ok(());
    }
    assert_eq!(code, STARTUP_CODE, "unexpected startup code");

    let pid = state.next_pid.fetch_add(1, Ordering::SeqCst);
    state.sessions.lock().push(pid);

    // AuthenticationOk.
    let mut welcome = BytesMut::new();
    welcome.put_u8(b'R');
    welcome.put_i32(8);
    welcome.put_i32(0);
    // A few ParameterStatus messages.
    for (key, value) in [
        ("server_version", "15.4 (fake)"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
        ("TimeZone", "Etc/UTC"),
        ("standard_conforming_strings", "on"),
        ("application_name", ""),
    ] {
        welcome.put_u8(b'S');
        welcome.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
        welcome.put_slice(key.as_bytes());
        welcome.put_u8(0);
        welcome.put_slice(value.as_bytes());
        welcome.put_u8(0);
    }
    // BackendKeyData.
    welcome.put_u8(b'K');
    welcome.put_i32(12);
    welcome.put_i32(pid);
    welcome.put_i32(pid.wrapping_mul(7));
    // ReadyForQuery.
    welcome.put_u8(b'Z');
    welcome.put_i32(5);
    welcome.put_u8(b'I');
    socket.write_all(&welcome).await?;

    let mut in_transaction = false;

    loop {
        let code = match socket.read_u8().await {
            Ok(code) => code,
            Err(_) => return Ok(()),
        };
        let len = socket.read_i32().await?;
        let mut body = vec![0u8; (len - 4) as usize];
        socket.read_exact(&mut body).await?;

        match code {
            b'X' => return Ok(()),

            b'Q' => {
                let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                let sql = String::from_utf8_lossy(&body[..end]).to_string();
                let command = sql.trim().trim_end_matches(';').trim().to_uppercase();

                let tag = if command.starts_with("BEGIN") {
                    in_transaction = true;
                    "BEGIN".to_string()
                } else if command.starts_with("COMMIT") {
                    in_transaction = false;
                    "COMMIT".to_string()
                } else if command.starts_with("ROLLBACK") {
                    in_transaction = false;
                    "ROLLBACK".to_string()
                } else if command.starts_with("SELECT PG_SLEEP") {
                    // Park until canceled; a real backend would block
                    // here too.
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    "SELECT 1".to_string()
                } else {
                    command
                        .split_whitespace()
                        .next()
                        .unwrap_or("SELECT")
                        .to_string()
                };

                let mut response = BytesMut::new();
                // Multi-statement control strings get one tag per
                // statement; close enough for a pool test.
                for _ in 0..sql.matches(';').count().max(1) {
                    response.put_u8(b'C');
                    response.put_i32(4 + tag.len() as i32 + 1);
                    response.put_slice(tag.as_bytes());
                    response.put_u8(0);
                }
                response.put_u8(b'Z');
                response.put_i32(5);
                response.put_u8(if in_transaction { b'T' } else { b'I' });
                socket.write_all(&response).await?;
            }

            // Extended protocol: acknowledge on Sync.
            b'P' | b'B' | b'D' | b'E' | b'C' | b'H' => {
                let ack = match code {
                    b'P' => Some(b'1'),
                    b'B' => Some(b'2'),
                    b'C' => Some(b'3'),
                    _ => None,
                };
                if let Some(ack) = ack {
                    let mut response = BytesMut::new();
                    response.put_u8(ack);
                    response.put_i32(4);
                    socket.write_all(&response).await?;
                }
                if code == b'E' {
                    let mut response = BytesMut::new();
                    response.put_u8(b'C');
                    response.put_i32(4 + 9);
                    response.put_slice(b"SELECT 1\0");
                    socket.write_all(&response).await?;
                }
            }

            b'S' => {
                let mut response = BytesMut::new();
                response.put_u8(b'Z');
                response.put_i32(5);
                response.put_u8(if in_transaction { b'T' } else { b'I' });
                socket.write_all(&response).await?;
            }

            _ => {
                // Drop everything else on the floor.
            }
        }
    }
}
