//! TCP bulk channel: one `<hex key>\n` request and one length-prefixed payload per connection.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::{common::Id, rpc::socket::MAX_THREAD_BLOCK_DURATION, storage::Storage};

/// Largest payload a client agrees to read.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Longest request line accepted by the server, a hex key plus the newline.
const MAX_REQUEST_LINE: u64 = 2 * 64 + 2;

/// Connections served at once, further ones wait in the listener backlog.
pub const MAX_CONCURRENT_TRANSFERS: usize = 64;

#[derive(Debug)]
/// Serves stored chunks on a [TcpListener] from a background thread.
///
/// The listener thread exits once this handle is dropped.
pub struct BulkServer {
    local_addr: SocketAddr,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BulkServer {
    pub fn start(
        listener: TcpListener,
        storage: Arc<dyn Storage>,
        timeout: Duration,
    ) -> Result<Self, io::Error> {
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (shutdown, receiver) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name("chunkdht-bulk".to_string())
            .spawn(move || listen(listener, storage, timeout, receiver))?;

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for BulkServer {
    fn drop(&mut self) {
        self.shutdown.take();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn listen(
    listener: TcpListener,
    storage: Arc<dyn Storage>,
    timeout: Duration,
    shutdown: Receiver<()>,
) {
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        if let Err(TryRecvError::Disconnected) = shutdown.try_recv() {
            break;
        }

        if active.load(Ordering::Acquire) >= MAX_CONCURRENT_TRANSFERS {
            thread::sleep(MAX_THREAD_BLOCK_DURATION);
            continue;
        }

        match listener.accept() {
            Ok((stream, from)) => {
                let storage = storage.clone();
                let active = active.clone();

                active.fetch_add(1, Ordering::AcqRel);

                thread::spawn(move || {
                    if let Err(error) = serve(stream, storage.as_ref(), timeout) {
                        debug!(context = "bulk_serving", ?from, ?error, "Bulk transfer failed");
                    }

                    active.fetch_sub(1, Ordering::AcqRel);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(error) => {
                debug!(context = "bulk_serving", ?error, "accept failed unexpectedly");
            }
        }
    }

    trace!(context = "bulk_serving", "Bulk listener stopped");
}

/// Answer a single request, then close the connection.
fn serve(stream: TcpStream, storage: &dyn Storage, timeout: Duration) -> Result<(), io::Error> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut line = String::new();
    BufReader::new(&stream)
        .take(MAX_REQUEST_LINE)
        .read_line(&mut line)?;

    let key = line.trim();

    match storage.get(key) {
        Some(data) => {
            trace!(context = "bulk_serving", ?key, size = data.len(), "Serving chunk");

            let len = u32::try_from(data.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;

            let mut stream = &stream;
            stream.write_all(&len.to_le_bytes())?;
            stream.write_all(&data)?;
            stream.flush()?;
        }
        None => {
            trace!(context = "bulk_serving", ?key, "Chunk not found");
        }
    }

    Ok(())
}

/// Fetch the payload stored under `id` from the bulk channel at `address`.
///
/// Returns `Ok(None)` if the remote closed the connection without sending
/// anything, meaning it doesn't hold the chunk. The payload is NOT verified
/// against `id`.
///
/// `timeout` bounds the whole exchange, not each read.
pub fn fetch(address: SocketAddr, id: &Id, timeout: Duration) -> Result<Option<Bytes>, BulkError> {
    let deadline = Instant::now() + timeout;

    let mut stream = TcpStream::connect_timeout(&address, timeout)?;
    stream.set_write_timeout(Some(timeout))?;

    stream.write_all(format!("{id}\n").as_bytes())?;
    stream.flush()?;

    let mut header = [0u8; 4];

    match read_until(&mut stream, &mut header, deadline)? {
        0 => return Ok(None),
        4 => {}
        _ => return Err(BulkError::Truncated),
    }

    let len = u32::from_le_bytes(header) as usize;

    if len > MAX_PAYLOAD_SIZE {
        return Err(BulkError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];

    if read_until(&mut stream, &mut payload, deadline)? < len {
        return Err(BulkError::Truncated);
    }

    Ok(Some(payload.into()))
}

/// Fill `buf` until the end of the stream or `deadline`, returning how many bytes were read.
fn read_until(stream: &mut TcpStream, buf: &mut [u8], deadline: Instant) -> Result<usize, io::Error> {
    let mut read = 0;

    while read < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());

        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "bulk transfer deadline elapsed"));
        }

        stream.set_read_timeout(Some(remaining))?;

        match stream.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(read)
}

#[derive(thiserror::Error, Debug)]
/// Errors fetching a payload over the bulk channel.
pub enum BulkError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Connection closed before the whole payload was received")]
    Truncated,

    #[error("Payload of {0} bytes exceeds the maximum size")]
    TooLarge(usize),
}
