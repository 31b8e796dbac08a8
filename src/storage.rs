/*
src/storage.rs

Destination-file handling for a download. The file is created at its final
size up front, so a worker can seek straight to a chunk's offset without ever
racing a length change; missed chunks simply leave zero-filled gaps. Workers
on several threads share one handle, so seek + write happen under a single
mutex.
*/

use crate::CHUNK_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub struct ChunkFile {
    file: Mutex<File>,
    path: PathBuf,
    length: u64,
}

impl ChunkFile {
    /// Creates (or truncates) the file at `path` and extends it to exactly
    /// `length` bytes.
    pub fn create(path: &Path, length: u64) -> io::Result<ChunkFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(length)?;

        Ok(ChunkFile {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            length,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Writes one chunk's payload at `index * CHUNK_SIZE`. The write must
    /// land entirely inside the pre-sized file.
    pub fn write_chunk(&self, index: u64, data: &[u8]) -> io::Result<()> {
        let offset = index * CHUNK_SIZE;
        let end = offset + data.len() as u64;
        if end > self.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk {} would write past {} bytes", index, self.length),
            ));
        }

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    /// Reads the whole file back; test support for verifying downloads.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.length as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}
