//! Connection handling: framed transport shared by the SQL and REST
//! listeners, plus the listener accept loops.
//!
//! Frames are a little-endian u32 length prefix followed by a JSON payload.
//! The real wire protocol's message definitions live outside the engine;
//! this framing only carries them.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use serde_derive::Serialize as DeriveSerialize;

use strata::request::Response;

pub mod rest;
pub mod sql;

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads one frame; `None` on a clean connection close.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut length_bytes = [0u8; 4];
    match stream.read_exact(&mut length_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let length = LittleEndian::read_u32(&length_bytes) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(anyhow!("frame of {} bytes exceeds the limit", length));
    }
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).context("connection closed mid-frame")?;
    Ok(Some(payload))
}

pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> Result<()> {
    let mut length_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut length_bytes, payload.len() as u32);
    stream.write_all(&length_bytes)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub fn write_message<T: Serialize>(stream: &mut impl Write, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(stream, &payload)
}

/// Response frame sent back for one executed statement.
#[derive(Debug, DeriveSerialize)]
pub struct ResponseMessage {
    pub request_id: u64,
    pub response_id: u32,
    pub statement_count: usize,
    #[serde(flatten)]
    pub response: Response,
}

/// Spawns an accept loop on its own thread. Each accepted connection runs
/// on a dedicated thread; the loop observes the shutdown flag on every
/// accept wake-up.
pub fn spawn_listener(
    name: &'static str,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    serve: Arc<dyn Fn(TcpStream) + Send + Sync>,
) -> Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    log::info!("{} listener started on {}", name, local_addr);
    let handle = std::thread::Builder::new()
        .name(format!("{}-listener", name))
        .spawn(move || {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        log::info!("{}: accepted connection from {}", name, peer);
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        let serve = serve.clone();
                        let spawned = std::thread::Builder::new()
                            .name(format!("{}-conn", name))
                            .spawn(move || serve(stream));
                        if let Err(err) = spawned {
                            log::error!("{}: cannot spawn connection thread: {}", name, err);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(err) => {
                        log::error!("{}: accept failed: {}", name, err);
                        std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                }
            }
            log::info!("{} listener on {} stopped", name, local_addr);
        })?;
    Ok(handle)
}
