use super::*;

/// Vendor/product identity used to select devices during enumeration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HardwareID {
    pub vid: u16,
    pub pid: u16,
}

impl HardwareID {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl std::fmt::Display for HardwareID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vid: 0x{:04x}, pid: 0x{:04x}", self.vid, self.pid)
    }
}

/// Interface summary carried in OP_REP_DEVLIST records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// A device record as reported by OP_REP_DEVLIST or OP_REP_IMPORT
#[derive(Clone, Debug, Default)]
pub struct RemoteDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    /// Populated from devlist replies only; import replies carry none
    pub interfaces: Vec<DeviceInterface>,
}

impl RemoteDevice {
    /// Identifies the device to the server within a session
    pub fn devid(&self) -> u32 {
        self.busnum << 16 | self.devnum
    }

    pub fn matches(&self, id: &HardwareID) -> bool {
        self.vendor_id == id.vid && self.product_id == id.pid
    }

    pub(crate) async fn read_from_socket<T: AsyncReadExt + Unpin>(
        socket: &mut T,
        with_interfaces: bool,
    ) -> Result<RemoteDevice> {
        let path = read_fixed_string(socket, SYSFS_PATH_LEN).await?;
        let busid = read_fixed_string(socket, BUSID_LEN).await?;

        let mut dev = RemoteDevice {
            path,
            busid,
            busnum: socket.read_u32().await?,
            devnum: socket.read_u32().await?,
            speed: socket.read_u32().await?,
            vendor_id: socket.read_u16().await?,
            product_id: socket.read_u16().await?,
            bcd_device: socket.read_u16().await?,
            device_class: socket.read_u8().await?,
            device_subclass: socket.read_u8().await?,
            device_protocol: socket.read_u8().await?,
            configuration_value: socket.read_u8().await?,
            num_configurations: socket.read_u8().await?,
            num_interfaces: socket.read_u8().await?,
            interfaces: vec![],
        };

        if with_interfaces {
            for _ in 0..dev.num_interfaces {
                let interface = DeviceInterface {
                    class: socket.read_u8().await?,
                    subclass: socket.read_u8().await?,
                    protocol: socket.read_u8().await?,
                };
                // alignment byte
                socket.read_u8().await?;
                dev.interfaces.push(interface);
            }
        }
        Ok(dev)
    }
}

/// A remote device that completed the attach sequence
#[derive(Clone, Debug)]
pub struct AttachedDevice {
    pub remote: RemoteDevice,
    pub hardware_id: HardwareID,
    pub devid: u32,
    pub device_descriptor: DeviceDescriptor,
    pub endpoints: CdcEndpointPair,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::tests::*;

    #[test]
    fn devid_is_busnum_devnum_composite() {
        let dev = RemoteDevice {
            busnum: 1,
            devnum: 2,
            ..RemoteDevice::default()
        };
        assert_eq!(dev.devid(), 0x0001_0002);
    }

    #[tokio::test]
    async fn parse_import_device_record() {
        let mut record = vec![];
        let mut path = b"/sys/devices/pci0000:00/usb1/1-1".to_vec();
        path.resize(SYSFS_PATH_LEN, 0);
        record.extend_from_slice(&path);
        let mut busid = b"1-1".to_vec();
        busid.resize(BUSID_LEN, 0);
        record.extend_from_slice(&busid);
        record.extend_from_slice(&1u32.to_be_bytes()); // busnum
        record.extend_from_slice(&5u32.to_be_bytes()); // devnum
        record.extend_from_slice(&3u32.to_be_bytes()); // speed
        record.extend_from_slice(&0x1f46u16.to_be_bytes());
        record.extend_from_slice(&0x1b01u16.to_be_bytes());
        record.extend_from_slice(&0x0200u16.to_be_bytes());
        record.extend_from_slice(&[0x02, 0x00, 0x00, 0x01, 0x01, 0x02]);

        let mut socket = MockSocket::new(record);
        let dev = RemoteDevice::read_from_socket(&mut socket, false)
            .await
            .unwrap();
        assert_eq!(dev.busid, "1-1");
        assert_eq!(dev.devid(), 1 << 16 | 5);
        assert!(dev.matches(&HardwareID::new(0x1f46, 0x1b01)));
        assert_eq!(dev.num_interfaces, 2);
        assert!(dev.interfaces.is_empty());
    }
}
