/*
src/server.rs

TCP service answering the three request types against the shared folder. The
listener binds an OS-assigned port (the discovery service asks for it through
`port()` when announcing us). Every accepted connection gets its own handler
thread; an I/O error aborts that one connection only.

A handler reads a single command string and replies per the wire script:

    REQUEST_FILE_LIST        -> "FILE_LIST" u32(count) {string(name)}*
    REQUEST_FILE_INFO <name> -> u64(length | -1)
    REQUEST_CHUNK <name> <i> -> u32(i | -1) u32(len) blob(len), then u32 ack
*/

use crate::catalog::{self, SharedFolder};
use crate::error::{ShareError, ShareResult};
use crate::wire;
use crate::{chunk_count, CHUNK_SIZE, TRANSFER_TIMEOUT};

use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const CMD_FILE_LIST: &str = "REQUEST_FILE_LIST";
pub const CMD_FILE_INFO: &str = "REQUEST_FILE_INFO";
pub const CMD_CHUNK: &str = "REQUEST_CHUNK";
pub const FILE_LIST_HEADER: &str = "FILE_LIST";

/// How long the accept loop sleeps between polls of its non-blocking
/// listener; bounds how quickly shutdown is observed.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct FileServer {
    listener: TcpListener,
    port: u16,
    folder: Arc<dyn SharedFolder>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    /// Binds an OS-assigned port. Nothing is served until `start`.
    pub fn new(folder: Arc<dyn SharedFolder>) -> std::io::Result<Arc<FileServer>> {
        let listener = TcpListener::bind("0.0.0.0:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        Ok(Arc::new(FileServer {
            listener,
            port,
            folder,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        }))
    }

    /// The OS-assigned service port, valid as soon as `new` returns.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let server = Arc::clone(self);
        let handle = thread::spawn(move || server.accept_loop());
        *self.accept_thread.lock().unwrap() = Some(handle);
        log::info!("file server listening on tcp port {}", self.port);
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("file server stopped");
    }

    fn accept_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::debug!("connection from {}", addr);
                    let dir = self.folder.shared_dir();
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, dir) {
                            log::debug!("handler for {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

/// Serves exactly one command on the connection, then returns; the stream
/// and any opened file close on every path out.
fn handle_client(mut stream: TcpStream, dir: PathBuf) -> ShareResult<()> {
    // the accepted socket inherits no timeouts, and non-blocking state
    // differs by platform; pin both down
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(TRANSFER_TIMEOUT))?;
    stream.set_write_timeout(Some(TRANSFER_TIMEOUT))?;

    let command = wire::read_string(&mut stream)?;

    if command == CMD_FILE_LIST {
        send_file_list(&mut stream, &dir)
    } else if let Some(name) = command.strip_prefix(CMD_FILE_INFO) {
        send_file_info(&mut stream, &dir, name.trim_start())
    } else if let Some(tail) = command.strip_prefix(CMD_CHUNK) {
        send_chunk(&mut stream, &dir, tail.trim_start())
    } else {
        log::warn!("unknown command {:?}", command);
        let _ = wire::write_string(&mut stream, &format!("ERROR unknown command {}", command));
        Err(ShareError::UnknownCommand(command))
    }
}

fn send_file_list(stream: &mut TcpStream, dir: &std::path::Path) -> ShareResult<()> {
    let names = catalog::list_files(dir)?;
    wire::write_string(stream, FILE_LIST_HEADER)?;
    wire::write_u32(stream, names.len() as u32)?;
    for name in &names {
        wire::write_string(stream, name)?;
    }
    log::debug!("sent file list ({} entries)", names.len());
    Ok(())
}

fn send_file_info(stream: &mut TcpStream, dir: &std::path::Path, name: &str) -> ShareResult<()> {
    match catalog::resolve(dir, name) {
        Some(path) => {
            let length = std::fs::metadata(path)?.len();
            log::debug!("file info {:?}: {} bytes", name, length);
            wire::write_u64(stream, length)?;
        }
        None => {
            log::debug!("file info {:?}: not shared", name);
            wire::write_u64(stream, wire::NONE_U64)?;
        }
    }
    Ok(())
}

/// `tail` is `<name> <id>`; the name may itself contain spaces, so the id is
/// split off the right.
fn send_chunk(stream: &mut TcpStream, dir: &std::path::Path, tail: &str) -> ShareResult<()> {
    let (name, id) = tail
        .rsplit_once(' ')
        .ok_or_else(|| ShareError::MalformedFrame(format!("chunk request {:?}", tail)))?;
    let id: i64 = id.parse()?;

    let path = match catalog::resolve(dir, name) {
        Some(path) => path,
        None => return refuse_chunk(stream, name, id),
    };
    let length = std::fs::metadata(&path)?.len();
    if id < 0 || id as u64 >= chunk_count(length) {
        return refuse_chunk(stream, name, id);
    }
    let id = id as u64;

    let mut file = File::open(&path)?;
    file.seek(SeekFrom::Start(id * CHUNK_SIZE))?;
    let mut payload = Vec::with_capacity(CHUNK_SIZE as usize);
    file.take(CHUNK_SIZE).read_to_end(&mut payload)?;

    // one frame, one write: id, size, then the raw bytes
    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u32(id as u32);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    stream.write_all(&frame)?;

    let ack = wire::read_u32(stream)?;
    if ack != id as u32 {
        log::warn!("chunk {} of {:?} acked as {}", id, name, ack);
    } else {
        log::debug!("served chunk {} of {:?} ({} bytes)", id, name, payload.len());
    }
    Ok(())
}

fn refuse_chunk(stream: &mut TcpStream, name: &str, id: i64) -> ShareResult<()> {
    log::debug!("refusing chunk {} of {:?}", id, name);
    wire::write_u32(stream, wire::NONE_U32)?;
    Ok(())
}
