use super::*;

/// The SETUP packet of control transfers
///
/// Multi-byte fields are little-endian on the wire (USB 2.0 §9.3), unlike the
/// surrounding USB/IP header which is big-endian. The 8-byte field must never
/// be byte-swapped wholesale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Parse a [SetupPacket] from the raw 8 bytes
    pub fn parse(setup: &[u8; 8]) -> SetupPacket {
        SetupPacket {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_le_bytes([setup[2], setup[3]]),
            index: u16::from_le_bytes([setup[4], setup[5]]),
            length: u16::from_le_bytes([setup[6], setup[7]]),
        }
    }

    /// Encode into the 8-byte wire form
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut result = [0u8; 8];
        result[0] = self.request_type;
        result[1] = self.request;
        result[2..4].copy_from_slice(&self.value.to_le_bytes());
        result[4..6].copy_from_slice(&self.index.to_le_bytes());
        result[6..8].copy_from_slice(&self.length.to_le_bytes());
        result
    }

    /// Transfer direction implied by bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & request_type::DEVICE_TO_HOST != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// GET_DESCRIPTOR for the given type and index
    pub fn get_descriptor(desc_type: DescriptorType, index: u8, length: u16) -> SetupPacket {
        SetupPacket {
            request_type: request_type::DEVICE_TO_HOST,
            request: StandardRequest::GetDescriptor as u8,
            value: (desc_type as u16) << 8 | index as u16,
            index: 0,
            length,
        }
    }

    /// SET_CONFIGURATION with the given bConfigurationValue
    pub fn set_configuration(configuration_value: u8) -> SetupPacket {
        SetupPacket {
            request_type: request_type::HOST_TO_DEVICE,
            request: StandardRequest::SetConfiguration as u8,
            value: configuration_value as u16,
            index: 0,
            length: 0,
        }
    }

    /// SET_INTERFACE selecting an alternate setting of an interface
    pub fn set_interface(interface: u8, alt_setting: u8) -> SetupPacket {
        SetupPacket {
            request_type: request_type::HOST_TO_DEVICE | request_type::RECIPIENT_INTERFACE,
            request: StandardRequest::SetInterface as u8,
            value: alt_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }

    /// A CDC class request directed at an interface
    pub fn cdc_class(request: CdcRequest, value: u16, interface: u8, length: u16) -> SetupPacket {
        let direction = match request {
            CdcRequest::GetLineCoding => request_type::DEVICE_TO_HOST,
            _ => request_type::HOST_TO_DEVICE,
        };
        SetupPacket {
            request_type: direction | request_type::TYPE_CLASS | request_type::RECIPIENT_INTERFACE,
            request: request as u8,
            value,
            index: interface as u16,
            length,
        }
    }
}

/// CDC line coding, the payload of SET_LINE_CODING
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineCoding {
    pub baud_rate: u32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2
    pub stop_bits: u8,
    /// 0 = none, 1 = odd, 2 = even
    pub parity: u8,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    /// Encode as the 7-byte little-endian wire form
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut result = [0u8; 7];
        result[0..4].copy_from_slice(&self.baud_rate.to_le_bytes());
        result[4] = self.stop_bits;
        result[5] = self.parity;
        result[6] = self.data_bits;
        result
    }
}
