//! USB/IP wire protocol structs, client side
//!
//! Declarations of the packets a client exchanges with a usbipd server,
//! functions to serialize requests to byte vectors, and functions to read
//! replies from a socket.
//!
//! Layouts follow the [Linux kernel documentation](https://docs.kernel.org/usb/usbip_protocol.html).
//! Two framing layers exist: the 8-byte op layer used while enumerating and
//! importing, and the 48-byte command layer used for URB traffic once a
//! device is attached. All header fields are big-endian; the embedded USB
//! setup packet stays little-endian (see [crate::SetupPacket]).

use super::*;

/// Common header for all context sensitive packets
///
/// Every command-layer packet starts with these five fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIpHeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UsbIpHeaderBasic {
    /// Converts a byte array into a [UsbIpHeaderBasic].
    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        UsbIpHeaderBasic {
            command: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            seqnum: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            devid: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            direction: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            ep: u32::from_be_bytes(bytes[16..20].try_into().unwrap()),
        }
    }

    /// Converts the [UsbIpHeaderBasic] into a byte array.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut result = [0u8; 20];
        result[0..4].copy_from_slice(&self.command.to_be_bytes());
        result[4..8].copy_from_slice(&self.seqnum.to_be_bytes());
        result[8..12].copy_from_slice(&self.devid.to_be_bytes());
        result[12..16].copy_from_slice(&self.direction.to_be_bytes());
        result[16..20].copy_from_slice(&self.ep.to_be_bytes());
        result
    }
}

/// Requests this client sends to the usbipd server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbIpRequest {
    OpReqDevlist,
    OpReqImport {
        busid: String,
    },
    CmdSubmit {
        header: UsbIpHeaderBasic,
        transfer_flags: u32,
        transfer_buffer_length: u32,
        start_frame: u32,
        number_of_packets: u32,
        interval: u32,
        setup: [u8; 8],
        data: Vec<u8>,
    },
    CmdUnlink {
        header: UsbIpHeaderBasic,
        unlink_seqnum: u32,
    },
}

impl UsbIpRequest {
    /// Converts the [UsbIpRequest] into a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            UsbIpRequest::OpReqDevlist => {
                let mut result = Vec::with_capacity(8);
                result.extend_from_slice(&USBIP_VERSION.to_be_bytes());
                result.extend_from_slice(&OP_REQ_DEVLIST.to_be_bytes());
                result.extend_from_slice(&0u32.to_be_bytes());
                result
            }
            UsbIpRequest::OpReqImport { ref busid } => {
                let mut result = Vec::with_capacity(8 + BUSID_LEN);
                result.extend_from_slice(&USBIP_VERSION.to_be_bytes());
                result.extend_from_slice(&OP_REQ_IMPORT.to_be_bytes());
                result.extend_from_slice(&0u32.to_be_bytes());
                result.extend_from_slice(&fixed_string(busid, BUSID_LEN));
                result
            }
            UsbIpRequest::CmdSubmit {
                ref header,
                transfer_flags,
                transfer_buffer_length,
                start_frame,
                number_of_packets,
                interval,
                setup,
                ref data,
            } => {
                let mut result = Vec::with_capacity(CMD_HEADER_LEN + data.len());
                result.extend_from_slice(&header.to_bytes());
                result.extend_from_slice(&transfer_flags.to_be_bytes());
                result.extend_from_slice(&transfer_buffer_length.to_be_bytes());
                result.extend_from_slice(&start_frame.to_be_bytes());
                result.extend_from_slice(&number_of_packets.to_be_bytes());
                result.extend_from_slice(&interval.to_be_bytes());
                result.extend_from_slice(&setup);
                result.extend_from_slice(data);
                result
            }
            UsbIpRequest::CmdUnlink {
                ref header,
                unlink_seqnum,
            } => {
                let mut result = Vec::with_capacity(CMD_HEADER_LEN);
                result.extend_from_slice(&header.to_bytes());
                result.extend_from_slice(&unlink_seqnum.to_be_bytes());
                result.extend_from_slice(&[0; 24]);
                result
            }
        }
    }
}

/// Fixed prefix of a RET_SUBMIT frame, minus the trailing payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmitPrefix {
    pub header: UsbIpHeaderBasic,
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

/// A RET_UNLINK frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: UsbIpHeaderBasic,
    pub status: i32,
}

/// A parsed command-layer header block from the server
///
/// The payload of a RET_SUBMIT (if any) follows the 48 bytes on the wire and
/// is read separately: whether one is present depends on the direction of the
/// submit being answered, which the server does not echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdFrame {
    RetSubmit(RetSubmitPrefix),
    RetUnlink(RetUnlink),
}

impl CmdFrame {
    /// Parse a 48-byte command-layer block received from the server
    pub fn from_bytes(bytes: &[u8; CMD_HEADER_LEN]) -> Result<CmdFrame> {
        let header = UsbIpHeaderBasic::from_bytes(bytes[0..20].try_into().unwrap());
        match header.command {
            USBIP_RET_SUBMIT => Ok(CmdFrame::RetSubmit(RetSubmitPrefix {
                header,
                status: i32::from_be_bytes(bytes[20..24].try_into().unwrap()),
                actual_length: i32::from_be_bytes(bytes[24..28].try_into().unwrap()),
                start_frame: i32::from_be_bytes(bytes[28..32].try_into().unwrap()),
                number_of_packets: i32::from_be_bytes(bytes[32..36].try_into().unwrap()),
                error_count: i32::from_be_bytes(bytes[36..40].try_into().unwrap()),
            })),
            USBIP_RET_UNLINK => Ok(CmdFrame::RetUnlink(RetUnlink {
                header,
                status: i32::from_be_bytes(bytes[20..24].try_into().unwrap()),
            })),
            other => Err(Error::MalformedFrame(format!(
                "unknown command: {:#010x}",
                other
            ))),
        }
    }
}

/// Op-layer replies received while enumerating and importing
#[derive(Debug, Clone)]
pub enum OpReply {
    Devlist {
        status: u32,
        devices: Vec<RemoteDevice>,
    },
    Import {
        status: i32,
        device: Option<RemoteDevice>,
    },
}

impl OpReply {
    /// Read one op-layer reply from the socket
    ///
    /// Consumes a variable number of bytes: the 8-byte header, then a
    /// code-specific payload (length-prefixed device records for
    /// OP_REP_DEVLIST, one record for a successful OP_REP_IMPORT).
    pub async fn read_from_socket<T: AsyncReadExt + Unpin>(socket: &mut T) -> Result<OpReply> {
        let version = socket.read_u16().await?;
        let code = socket.read_u16().await?;
        if version != USBIP_VERSION {
            return Err(Error::MalformedFrame(format!(
                "unknown version: {:#06x}",
                version
            )));
        }

        match code {
            OP_REP_DEVLIST => {
                let status = socket.read_u32().await?;
                let count = socket.read_u32().await?;
                let mut devices = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    devices.push(RemoteDevice::read_from_socket(socket, true).await?);
                }
                trace!("got OP_REP_DEVLIST with {} devices", devices.len());
                Ok(OpReply::Devlist { status, devices })
            }
            OP_REP_IMPORT => {
                let status = socket.read_u32().await? as i32;
                let device = if status == 0 {
                    Some(RemoteDevice::read_from_socket(socket, false).await?)
                } else {
                    None
                };
                trace!("got OP_REP_IMPORT status {}", status);
                Ok(OpReply::Import { status, device })
            }
            other => Err(Error::MalformedFrame(format!(
                "unknown op code: {:#06x}",
                other
            ))),
        }
    }
}
