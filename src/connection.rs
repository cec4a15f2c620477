//! Per-device byte pipe over the attached bulk endpoints

use super::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default read deadline for [Connection::response_data]
pub const DEFAULT_URB_TIMEOUT: Duration = Duration::from_secs(5);

/// A serial-style pipe to one attached device
///
/// Writes go to the bulk OUT endpoint via the shared engine; reads pull from
/// the bulk IN endpoint into an inbound buffer owned by this connection, with
/// a fixed-size or delimiter-terminated read discipline.
pub struct Connection {
    engine: Arc<UrbEngine>,
    device: AttachedDevice,
    pending_inbound: Vec<u8>,
    delimiter: Vec<u8>,
    default_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(engine: Arc<UrbEngine>, device: AttachedDevice) -> Self {
        Self {
            engine,
            device,
            pending_inbound: vec![],
            delimiter: b"\r\n".to_vec(),
            default_timeout: DEFAULT_URB_TIMEOUT,
        }
    }

    /// The device this connection talks to
    pub fn device(&self) -> &AttachedDevice {
        &self.device
    }

    pub fn busid(&self) -> &str {
        &self.device.remote.busid
    }

    pub fn devid(&self) -> u32 {
        self.device.devid
    }

    pub fn hardware_id(&self) -> HardwareID {
        self.device.hardware_id
    }

    pub fn endpoints(&self) -> &CdcEndpointPair {
        &self.device.endpoints
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn set_delimiter(&mut self, delimiter: &[u8]) {
        self.delimiter = delimiter.to_vec();
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    /// Write bytes to the device's bulk OUT endpoint
    ///
    /// Returns once the CMD_SUBMIT frame has been handed to the transport.
    pub async fn sendall(&self, data: &[u8]) -> Result<()> {
        let ep = self.device.endpoints.out_number();
        self.engine
            .submit_out(self.device.devid, ep, data)
            .await
            .map(|_| ())
    }

    /// Read from the device with the default deadline, see [Self::response_data_timeout]
    pub async fn response_data(&mut self, size: u32) -> Result<Vec<u8>> {
        self.response_data_timeout(size, self.default_timeout).await
    }

    /// Read from the device's bulk IN endpoint
    ///
    /// With `size > 0`, returns exactly `size` bytes. With `size == 0`,
    /// returns everything up to and including the first occurrence of the
    /// delimiter; bytes after it stay buffered for the next call. If the
    /// deadline elapses first, [Error::ReadTimeout] is returned and whatever
    /// arrived remains buffered.
    pub async fn response_data_timeout(&mut self, size: u32, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if size > 0 {
                if self.pending_inbound.len() >= size as usize {
                    return Ok(self.take(size as usize));
                }
            } else if let Some(end) = find_delimiter(&self.pending_inbound, &self.delimiter) {
                return Ok(self.take(end));
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(Error::ReadTimeout)?;

            let chunk = self
                .engine
                .submit_in(
                    self.device.devid,
                    self.device.endpoints.in_number(),
                    self.device.endpoints.max_in_packet as u32,
                    remaining,
                )
                .await?;
            self.pending_inbound.extend_from_slice(&chunk);
        }
    }

    /// Bytes received from the device but not yet consumed by a read
    pub fn buffered(&self) -> usize {
        self.pending_inbound.len()
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let rest = self.pending_inbound.split_off(count);
        std::mem::replace(&mut self.pending_inbound, rest)
    }
}

/// Offset one past the end of the first delimiter occurrence
fn find_delimiter(buffer: &[u8], delimiter: &[u8]) -> Option<usize> {
    if delimiter.is_empty() || buffer.len() < delimiter.len() {
        return None;
    }
    buffer
        .windows(delimiter.len())
        .position(|window| window == delimiter)
        .map(|pos| pos + delimiter.len())
}
