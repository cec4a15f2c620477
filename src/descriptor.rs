//! USB descriptor parsing
//!
//! Walks the TLV stream returned by GET_DESCRIPTOR(CONFIGURATION): the
//! configuration record followed by interface records, class-specific CDC
//! functional records and endpoint records, each prefixed with
//! `bLength, bDescriptorType`. The walk keeps the pieces needed to drive a
//! CDC serial device and drops the rest.

use super::*;

/// The fixed 18-byte device descriptor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub num_configurations: u8,
}

/// Parse a device descriptor as returned by GET_DESCRIPTOR(DEVICE)
pub fn parse_device(buf: &[u8]) -> Result<DeviceDescriptor> {
    if buf.len() < 18 || buf[0] < 18 {
        return Err(Error::MalformedDescriptor { offset: 0 });
    }
    if FromPrimitive::from_u8(buf[1]) != Some(DescriptorType::Device) {
        return Err(Error::MalformedDescriptor { offset: 0 });
    }
    Ok(DeviceDescriptor {
        bcd_usb: u16::from_le_bytes([buf[2], buf[3]]),
        device_class: buf[4],
        device_subclass: buf[5],
        device_protocol: buf[6],
        max_packet_size: buf[7],
        vendor_id: u16::from_le_bytes([buf[8], buf[9]]),
        product_id: u16::from_le_bytes([buf[10], buf[11]]),
        bcd_device: u16::from_le_bytes([buf[12], buf[13]]),
        num_configurations: buf[17],
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress; bit 7 set means IN
    pub address: u8,
    /// bmAttributes; bits 0-1 are the transfer type
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.address)
    }

    pub fn transfer_type(&self) -> Option<EndpointAttributes> {
        FromPrimitive::from_u8(self.attributes & 0x3)
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_type() == Some(EndpointAttributes::Bulk)
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        [
            0x07,
            DescriptorType::Endpoint as u8,
            self.address,
            self.attributes,
            self.max_packet_size as u8,
            (self.max_packet_size >> 8) as u8,
            self.interval,
        ]
    }
}

/// A class-specific (CS_INTERFACE) record kept verbatim
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdcFunctionalDescriptor {
    /// bDescriptorSubType
    pub subtype: u8,
    /// The whole record, length and type bytes included
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_interface: u8,
    /// CDC functional records declared under this interface
    pub functional: Vec<CdcFunctionalDescriptor>,
    /// Bulk endpoints only; other transfer types are dropped during the walk
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = vec![
            0x09,
            DescriptorType::Interface as u8,
            self.interface_number,
            self.alt_setting,
            self.num_endpoints,
            self.class,
            self.subclass,
            self.protocol,
            self.string_interface,
        ];
        for func in &self.functional {
            result.extend_from_slice(&func.raw);
        }
        for ep in &self.endpoints {
            result.extend_from_slice(&ep.to_bytes());
        }
        result
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigDescriptor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = vec![
            0x09,
            DescriptorType::Configuration as u8,
            self.total_length as u8,
            (self.total_length >> 8) as u8,
            self.num_interfaces,
            self.configuration_value,
            self.string_configuration,
            self.attributes,
            self.max_power,
        ];
        for interface in &self.interfaces {
            result.extend_from_slice(&interface.to_bytes());
        }
        result
    }

    /// Pick the bulk endpoint pair this device talks serial over
    ///
    /// The first data-class interface declaring both a bulk IN and a bulk OUT
    /// endpoint wins, lowest interface number breaking ties.
    pub fn cdc_endpoint_pair(&self) -> Result<CdcEndpointPair> {
        self.interfaces
            .iter()
            .enumerate()
            .filter(|(_, itf)| itf.class == ClassCode::CDCData as u8)
            .filter_map(|(idx, itf)| {
                let ep_in = itf.endpoints.iter().find(|ep| ep.direction() == Direction::In)?;
                let ep_out = itf.endpoints.iter().find(|ep| ep.direction() == Direction::Out)?;
                Some((idx, itf, ep_in, ep_out))
            })
            .min_by_key(|(idx, itf, _, _)| (*idx, itf.interface_number))
            .map(|(_, itf, ep_in, ep_out)| CdcEndpointPair {
                interface_number: itf.interface_number,
                alt_setting: itf.alt_setting,
                bulk_in: ep_in.address,
                bulk_out: ep_out.address,
                max_in_packet: ep_in.max_packet_size,
                max_out_packet: ep_out.max_packet_size,
            })
            .ok_or(Error::NotCdcSerial)
    }

    /// The communications (control) interface, when one is declared
    pub fn communications_interface(&self) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|itf| itf.class == ClassCode::CDC as u8)
    }
}

/// The bulk endpoints exposed per attached CDC device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CdcEndpointPair {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub max_in_packet: u16,
    pub max_out_packet: u16,
}

impl CdcEndpointPair {
    /// Endpoint number of the bulk IN endpoint as carried in the command header
    pub fn in_number(&self) -> u32 {
        (self.bulk_in & 0x7F) as u32
    }

    /// Endpoint number of the bulk OUT endpoint
    pub fn out_number(&self) -> u32 {
        (self.bulk_out & 0x7F) as u32
    }
}

/// Read wTotalLength out of the 9-byte head of a configuration descriptor
pub fn configuration_total_length(buf: &[u8]) -> Result<u16> {
    if buf.len() < 9 || buf[0] < 9 {
        return Err(Error::MalformedDescriptor { offset: 0 });
    }
    if FromPrimitive::from_u8(buf[1]) != Some(DescriptorType::Configuration) {
        return Err(Error::MalformedDescriptor { offset: 0 });
    }
    Ok(u16::from_le_bytes([buf[2], buf[3]]))
}

/// Parse a full configuration descriptor tree
pub fn parse_configuration(buf: &[u8]) -> Result<ConfigDescriptor> {
    let declared = configuration_total_length(buf)? as usize;
    if buf.len() < declared {
        return Err(Error::TruncatedDescriptor {
            declared,
            actual: buf.len(),
        });
    }

    let mut config = ConfigDescriptor {
        total_length: declared as u16,
        num_interfaces: buf[4],
        configuration_value: buf[5],
        string_configuration: buf[6],
        attributes: buf[7],
        max_power: buf[8],
        interfaces: vec![],
    };

    let mut offset = buf[0] as usize;
    while offset < declared {
        if declared - offset < 2 {
            return Err(Error::MalformedDescriptor { offset });
        }
        let length = buf[offset] as usize;
        if length < 2 {
            return Err(Error::MalformedDescriptor { offset });
        }
        if offset + length > declared {
            return Err(Error::TruncatedDescriptor {
                declared: offset + length,
                actual: declared,
            });
        }
        let record = &buf[offset..offset + length];

        match FromPrimitive::from_u8(record[1]) {
            Some(DescriptorType::Interface) => {
                if length < 9 {
                    return Err(Error::MalformedDescriptor { offset });
                }
                config.interfaces.push(InterfaceDescriptor {
                    interface_number: record[2],
                    alt_setting: record[3],
                    num_endpoints: record[4],
                    class: record[5],
                    subclass: record[6],
                    protocol: record[7],
                    string_interface: record[8],
                    functional: vec![],
                    endpoints: vec![],
                });
            }
            Some(DescriptorType::Endpoint) => {
                if length < 7 {
                    return Err(Error::MalformedDescriptor { offset });
                }
                let endpoint = EndpointDescriptor {
                    address: record[2],
                    attributes: record[3],
                    max_packet_size: u16::from_le_bytes([record[4], record[5]]),
                    interval: record[6],
                };
                let interface = config
                    .interfaces
                    .last_mut()
                    .ok_or(Error::MalformedDescriptor { offset })?;
                if endpoint.is_bulk() {
                    interface.endpoints.push(endpoint);
                } else {
                    trace!("dropping non-bulk endpoint {:#04x}", endpoint.address);
                }
            }
            Some(DescriptorType::CsInterface) => {
                if let Some(interface) = config.interfaces.last_mut() {
                    interface.functional.push(CdcFunctionalDescriptor {
                        subtype: if length > 2 { record[2] } else { 0 },
                        raw: record.to_vec(),
                    });
                }
            }
            // interface associations, strings and anything unrecognized are
            // skipped by their declared length
            _ => {}
        }
        offset += length;
    }

    Ok(config)
}
