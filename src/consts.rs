use num_derive::FromPrimitive;

/// USB/IP protocol version, the only one this crate speaks
pub const USBIP_VERSION: u16 = 0x0111;

/// Default TCP port of a usbipd server
pub const USBIP_PORT: u16 = 3240;

/// Op code: retrieve the list of exported USB devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Op code: the list of exported USB devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Op code: import a remote USB device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Op code: reply to import
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Command code: submit an URB
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
/// Command code: unlink an URB
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
/// Reply code: completion of a submitted URB
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
/// Reply code: completion of an unlink
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// Size of the fixed command-layer header
pub const CMD_HEADER_LEN: usize = 48;

/// Length of the busid field in op-layer packets
pub const BUSID_LEN: usize = 32;
/// Length of the sysfs path field in op-layer packets
pub const SYSFS_PATH_LEN: usize = 256;

/// usb.h transfer flag: transfer is device to host
pub const URB_DIR_IN: u32 = 0x0200;

// https://www.usb.org/defined-class-codes
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum ClassCode {
    SeeInterface = 0,
    Audio,
    CDC,
    HID,
    Physical = 0x05,
    Image,
    Printer,
    MassStorage,
    Hub,
    CDCData,
    SmartCard,
    ContentSecurity = 0x0D,
    Video,
    PersonalHealthcare,
    AudioVideo,
    Billboard,
    TypeCBridge,
    Diagnostic = 0xDC,
    WirelessController = 0xE0,
    Misc = 0xEF,
    ApplicationSpecific = 0xFE,
    VendorSpecific = 0xFF,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum EndpointAttributes {
    Control = 0,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Transfer direction from the client's point of view
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn of_endpoint(address: u8) -> Direction {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// CDC class-specific requests carried to the communications interface
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum CdcRequest {
    SetLineCoding = 0x20,
    GetLineCoding = 0x21,
    SetControlLineState = 0x22,
}

/// Control line bits for SET_CONTROL_LINE_STATE
pub const CDC_CTRL_DTR: u16 = 1 << 0;
pub const CDC_CTRL_RTS: u16 = 1 << 1;

/// Sub class code for CDC ACM
pub const CDC_ACM_SUBCLASS: u8 = 0x02;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    InterfaceAssociation = 0x0B,
    BOS = 0xF,
    CsInterface = 0x24,
}

/// bmRequestType bit fields for setup packets
pub mod request_type {
    pub const HOST_TO_DEVICE: u8 = 0;
    pub const DEVICE_TO_HOST: u8 = 1 << 7;
    pub const TYPE_STANDARD: u8 = 0;
    pub const TYPE_CLASS: u8 = 1 << 5;
    pub const TYPE_VENDOR: u8 = 2 << 5;
    pub const RECIPIENT_DEVICE: u8 = 0;
    pub const RECIPIENT_INTERFACE: u8 = 1;
    pub const RECIPIENT_ENDPOINT: u8 = 2;
}
