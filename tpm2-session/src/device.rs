// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transports and command framing
//!
//! Commands reach a TPM through a [`Transport`]: a character device
//! (`/dev/tpmrm0` or `/dev/tpm0`), a swtpm TCP command port, or the
//! in-process [`crate::Simulator`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::auth::AuthArea;
use crate::config::SessionConfig;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::simulator::Simulator;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

const HEADER_SIZE: usize = 10;

/// One request/response round trip with a TPM
///
/// Failures and timeouts surface as [`Error::Transport`].
pub trait Transport: Send {
    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).exchange(command)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).exchange(command)
    }
}

/// Pick a transport from the configured `device` string
pub fn open_transport(config: &SessionConfig) -> Result<Box<dyn Transport>> {
    let timeout = config.timeout();
    match config.device.as_deref() {
        None => Ok(Box::new(TpmDevice::detect(timeout)?)),
        Some("simulator") => Ok(Box::new(Simulator::new())),
        Some(path) if path.starts_with('/') || path.starts_with("device:") => {
            Ok(Box::new(TpmDevice::open(path, timeout)?))
        }
        Some(addr) => Ok(Box::new(TcpTransport::connect(addr, timeout)?)),
    }
}

/// TPM character device
pub struct TpmDevice {
    file: File,
    path: String,
    timeout: Duration,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str, timeout: Duration) -> Result<Self> {
        // Strip "device:" prefix if present
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| {
                io::Error::new(e.kind(), format!("failed to open TPM device {device_path}: {e}"))
            })?;
        debug!("opened TPM device {device_path}");

        Ok(Self {
            file,
            path: device_path.to_string(),
            timeout,
        })
    }

    /// Detect and open the default TPM device
    pub fn detect(timeout: Duration) -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0", timeout)
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0", timeout)
        } else {
            Err(Error::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                "TPM device not found",
            )))
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn wait_readable(&self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(self.timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        loop {
            // SAFETY: pfd is a valid pollfd for the duration of the call.
            let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            match n {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for TPM response",
                    ))
                }
                n if n > 0 => return Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }
}

impl Transport for TpmDevice {
    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file.write_all(command)?;
        self.wait_readable()?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self.file.read(&mut response)?;
        response.truncate(n);
        Ok(response)
    }
}

/// swtpm `--server type=tcp` command port
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let target = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}"))
        })?;
        let stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        debug!("connected to TPM at {addr}");
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.stream.write_all(command)?;
        let mut response = vec![0u8; HEADER_SIZE];
        self.stream.read_exact(&mut response)?;
        let size = u32::from_be_bytes([response[2], response[3], response[4], response[5]]) as usize;
        if !(HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            return Err(Error::protocol(format!("invalid response size {size}")));
        }
        response.resize(size, 0);
        self.stream.read_exact(&mut response[HEADER_SIZE..])?;
        Ok(response)
    }
}

/// TPM command builder
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code)
    }

    /// Create a new command with sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code)
    }

    fn with_tag(tag: TpmSt, command_code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(command_code.to_u32());

        Self { buf }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Authorization area: u32 size followed by the entries
    pub fn add_auth_areas(&mut self, areas: &[AuthArea]) {
        let mut inner = CommandBuffer::new();
        for area in areas {
            area.marshal(&mut inner);
        }
        self.buf.put_u32(inner.len() as u32);
        self.buf.put_bytes(inner.as_bytes());
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response header and body
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: ResponseCode,
    pub data: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::protocol(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| Error::protocol(format!("invalid response tag: 0x{tag_raw:04x}")))?;

        let size = buf.get_u32()? as usize;
        if size != response.len() {
            return Err(Error::protocol(format!(
                "TPM response size mismatch: header says {size}, got {}",
                response.len()
            )));
        }

        let response_code = ResponseCode(buf.get_u32()?);
        let data = response[HEADER_SIZE..].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code.is_success()
    }

    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }
}
