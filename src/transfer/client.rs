/*
src/transfer/client.rs

Client half of the transfer protocol. A connection carries exactly one
request/response exchange; every socket operation runs under an explicit
timeout, so nothing here blocks forever. Sentinel replies ("the peer does
not have that") surface as `None`, anything that violates the wire script
surfaces as an error.
*/

use crate::error::{ShareError, ShareResult};
use crate::peer::PeerAddr;
use crate::server::{CMD_CHUNK, CMD_FILE_INFO, CMD_FILE_LIST, FILE_LIST_HEADER};
use crate::wire;
use crate::CHUNK_SIZE;

use std::net::TcpStream;
use std::time::Duration;

pub struct PeerClient {
    stream: TcpStream,
    addr: PeerAddr,
}

impl PeerClient {
    pub fn connect(
        addr: &PeerAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> ShareResult<PeerClient> {
        let socket_addr = addr.socket_addr()?;
        let stream = TcpStream::connect_timeout(&socket_addr, connect_timeout)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        log::debug!("connected to {}", addr);
        Ok(PeerClient {
            stream,
            addr: addr.clone(),
        })
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.addr
    }

    /// Asks for the peer's current share catalog.
    pub fn request_file_list(&mut self) -> ShareResult<Vec<String>> {
        wire::write_string(&mut self.stream, CMD_FILE_LIST)?;

        let header = wire::read_string(&mut self.stream)?;
        if header != FILE_LIST_HEADER {
            return Err(ShareError::MalformedFrame(format!(
                "expected {}, got {:?}",
                FILE_LIST_HEADER, header
            )));
        }
        let count = wire::read_u32(&mut self.stream)?;
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            names.push(wire::read_string(&mut self.stream)?);
        }
        Ok(names)
    }

    /// Asks for a file's length; None if the peer does not share it.
    pub fn request_file_info(&mut self, name: &str) -> ShareResult<Option<u64>> {
        wire::write_string(&mut self.stream, &format!("{} {}", CMD_FILE_INFO, name))?;
        let length = wire::read_u64(&mut self.stream)?;
        if length == wire::NONE_U64 {
            Ok(None)
        } else {
            Ok(Some(length))
        }
    }

    /// Pulls one chunk; None if the peer does not have it. The ack is sent
    /// separately (after the bytes have been written locally) via
    /// [`PeerClient::send_ack`].
    pub fn request_chunk(&mut self, name: &str, id: u64) -> ShareResult<Option<Vec<u8>>> {
        wire::write_string(&mut self.stream, &format!("{} {} {}", CMD_CHUNK, name, id))?;

        let returned = wire::read_u32(&mut self.stream)?;
        if returned == wire::NONE_U32 {
            return Ok(None);
        }
        if returned as u64 != id {
            return Err(ShareError::MalformedFrame(format!(
                "asked for chunk {}, peer returned {}",
                id, returned
            )));
        }
        let size = wire::read_u32(&mut self.stream)?;
        if (size as i32) < 0 || size as u64 > CHUNK_SIZE {
            return Err(ShareError::MalformedFrame(format!(
                "chunk {} with claimed size {}",
                id, size
            )));
        }
        let payload = wire::read_blob(&mut self.stream, size as usize)?;
        Ok(Some(payload))
    }

    pub fn send_ack(&mut self, id: u64) -> ShareResult<()> {
        wire::write_u32(&mut self.stream, id as u32)?;
        Ok(())
    }
}
