//! A library for attaching to USB CDC serial devices exported over USB/IP
//!
//! Speaks the client side of the [USB/IP protocol](https://docs.kernel.org/usb/usbip_protocol.html):
//! enumerates the devices a remote usbipd server publishes, imports the ones
//! matching a caller-supplied set of vendor/product ids, discovers each
//! device's bulk endpoint pair from its configuration descriptor, and exposes
//! a per-device serial-style byte pipe. All attached devices multiplex over a
//! single TCP connection driven by one [UrbEngine].

use log::*;
use num_traits::FromPrimitive;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

mod connection;
mod consts;
mod descriptor;
mod device;
mod engine;
mod error;
mod protocol;
mod setup;
mod util;

pub use connection::*;
pub use consts::*;
pub use descriptor::*;
pub use device::*;
pub use engine::*;
pub use error::*;
pub use protocol::*;
pub use setup::*;
use util::*;

/// Default deadline for the devlist/import negotiation
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// A class-specific request issued to a device's communications interface
/// while configuring it
///
/// The wIndex of the resulting control transfer is filled in with the
/// interface number per device; everything else is caller-controlled, so any
/// CDC (or vendor) setup sequence can be expressed.
#[derive(Clone, Debug)]
pub struct ClassRequest {
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// Payload of the OUT data stage, empty for zero-length requests
    pub data: Vec<u8>,
}

impl ClassRequest {
    pub fn set_line_coding(coding: LineCoding) -> Self {
        Self {
            request: CdcRequest::SetLineCoding as u8,
            value: 0,
            data: coding.to_bytes().to_vec(),
        }
    }

    pub fn set_control_line_state(lines: u16) -> Self {
        Self {
            request: CdcRequest::SetControlLineState as u8,
            value: lines,
            data: vec![],
        }
    }

    /// 9600 8N1 with DTR and RTS raised, what a stock CDC ACM device expects
    pub fn default_sequence() -> Vec<ClassRequest> {
        vec![
            Self::set_line_coding(LineCoding::default()),
            Self::set_control_line_state(CDC_CTRL_DTR | CDC_CTRL_RTS),
        ]
    }
}

/// Per-busid failure recorded while attaching
#[derive(Debug)]
pub struct AttachFailure {
    pub busid: String,
    pub error: Error,
}

/// Outcome of [UsbIpClient::attach]: devices now ready and devices that
/// failed, reported together rather than aborting on the first error
#[derive(Debug, Default)]
pub struct AttachReport {
    /// busids of devices that reached the ready state, in server declaration order
    pub attached: Vec<String>,
    pub failures: Vec<AttachFailure>,
}

impl AttachReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pair matched devices with the id they matched, in server declaration order
fn select_devices(
    published: Vec<RemoteDevice>,
    wanted: &[HardwareID],
) -> Vec<(HardwareID, RemoteDevice)> {
    published
        .into_iter()
        .filter_map(|dev| {
            wanted
                .iter()
                .find(|id| dev.matches(id))
                .copied()
                .map(|id| (id, dev))
        })
        .collect()
}

/// Client session against one usbipd server
///
/// Construction does no I/O. [connect_server](Self::connect_server) opens the
/// TCP socket, [attach](Self::attach) negotiates devices onto it, and
/// [get_connection](Self::get_connection) hands out the byte pipes.
pub struct UsbIpClient {
    host: String,
    port: u16,
    socket: Option<TcpStream>,
    engine: Option<Arc<UrbEngine>>,
    reader_task: Option<JoinHandle<()>>,
    connections: Vec<Connection>,
    urb_timeout: Duration,
    attach_timeout: Duration,
    class_setup: Vec<ClassRequest>,
}

impl UsbIpClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket: None,
            engine: None,
            reader_task: None,
            connections: vec![],
            urb_timeout: DEFAULT_URB_TIMEOUT,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            class_setup: ClassRequest::default_sequence(),
        }
    }

    pub fn set_urb_timeout(&mut self, timeout: Duration) {
        self.urb_timeout = timeout;
    }

    pub fn set_attach_timeout(&mut self, timeout: Duration) {
        self.attach_timeout = timeout;
    }

    /// Replace the class-specific setup issued per attached interface
    pub fn set_class_setup(&mut self, requests: Vec<ClassRequest>) {
        self.class_setup = requests;
    }

    /// Open the TCP connection to the server
    pub async fn connect_server(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.host, self.port);
        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|source| Error::ConnectionRefused {
                addr: addr.clone(),
                source,
            })?;
        // frames are small and latency matters more than throughput
        socket.set_nodelay(true).ok();
        // sessions can sit quiet for hours; keep the server from reaping us
        socket2::SockRef::from(&socket).set_keepalive(true).ok();
        debug!("connected to {}", addr);
        self.socket = Some(socket);
        Ok(())
    }

    /// Attach every published device matching one of `devices`
    ///
    /// Runs the negotiation in two phases over the one socket: the op phase
    /// (OP_REQ_DEVLIST, then OP_REQ_IMPORT per selected device), then the
    /// command phase in which the [UrbEngine] takes the socket over and each
    /// imported device is enumerated and configured. Per-device failures are
    /// collected in the returned [AttachReport]; only socket-level faults
    /// abort the whole call. An empty device list is not an error.
    pub async fn attach(&mut self, devices: &[HardwareID]) -> Result<AttachReport> {
        if self.engine.is_some() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "session already attached",
            )));
        }
        self.connect_server().await?;
        let mut socket = self.socket.take().ok_or(Error::Disconnected)?;

        socket
            .write_all(&UsbIpRequest::OpReqDevlist.to_bytes())
            .await
            .map_err(Error::SendFailed)?;
        let reply = timeout(self.attach_timeout, OpReply::read_from_socket(&mut socket))
            .await
            .map_err(|_| Error::ReadTimeout)??;
        let published = match reply {
            OpReply::Devlist { status: 0, devices } => devices,
            OpReply::Devlist { status, .. } => {
                return Err(Error::MalformedFrame(format!(
                    "OP_REP_DEVLIST status {}",
                    status
                )))
            }
            OpReply::Import { .. } => {
                return Err(Error::MalformedFrame("expected OP_REP_DEVLIST".into()))
            }
        };
        debug!("server published {} devices", published.len());

        let selected = select_devices(published, devices);
        let mut report = AttachReport::default();
        let mut imported = vec![];
        for (id, dev) in selected {
            debug!("importing {} ({})", dev.busid, id);
            socket
                .write_all(
                    &UsbIpRequest::OpReqImport {
                        busid: dev.busid.clone(),
                    }
                    .to_bytes(),
                )
                .await
                .map_err(Error::SendFailed)?;
            let reply = timeout(self.attach_timeout, OpReply::read_from_socket(&mut socket))
                .await
                .map_err(|_| Error::ReadTimeout)??;
            match reply {
                OpReply::Import {
                    status: 0,
                    device: Some(device),
                } => imported.push((id, device)),
                OpReply::Import { status, .. } => {
                    warn!("import of {} refused with status {}", dev.busid, status);
                    report.failures.push(AttachFailure {
                        busid: dev.busid.clone(),
                        error: Error::AttachFailed {
                            busid: dev.busid,
                            status,
                        },
                    });
                }
                OpReply::Devlist { .. } => {
                    return Err(Error::MalformedFrame("expected OP_REP_IMPORT".into()))
                }
            }
        }

        if imported.is_empty() {
            self.socket = Some(socket);
            return Ok(report);
        }

        // command phase: the engine owns the socket from here on
        let (read_half, write_half) = socket.into_split();
        let (engine, task) = UrbEngine::start(read_half, write_half);
        self.engine = Some(engine.clone());
        self.reader_task = Some(task);

        for (id, dev) in imported {
            let busid = dev.busid.clone();
            match self.configure_device(&engine, id, dev).await {
                Ok(connection) => {
                    report.attached.push(busid);
                    self.connections.push(connection);
                }
                Err(Error::Disconnected) => return Err(Error::Disconnected),
                Err(error) => {
                    warn!("configuring {} failed: {}", busid, error);
                    report.failures.push(AttachFailure { busid, error });
                }
            }
        }
        Ok(report)
    }

    /// Enumerate and configure one imported device, yielding its byte pipe
    async fn configure_device(
        &self,
        engine: &Arc<UrbEngine>,
        hardware_id: HardwareID,
        remote: RemoteDevice,
    ) -> Result<Connection> {
        let devid = remote.devid();
        let deadline = self.urb_timeout;

        let raw = engine
            .control(
                devid,
                SetupPacket::get_descriptor(DescriptorType::Device, 0, 18),
                &[],
                deadline,
            )
            .await?;
        let device_descriptor = parse_device(&raw)?;

        // the 9-byte head tells us how big the full configuration tree is
        let head = engine
            .control(
                devid,
                SetupPacket::get_descriptor(DescriptorType::Configuration, 0, 9),
                &[],
                deadline,
            )
            .await?;
        let total = configuration_total_length(&head)?;
        let raw = engine
            .control(
                devid,
                SetupPacket::get_descriptor(DescriptorType::Configuration, 0, total),
                &[],
                deadline,
            )
            .await?;
        let config = parse_configuration(&raw)?;
        let endpoints = config.cdc_endpoint_pair()?;
        debug!(
            "{}: bulk IN {:#04x} / OUT {:#04x} on interface {}",
            remote.busid, endpoints.bulk_in, endpoints.bulk_out, endpoints.interface_number
        );

        // configuration first, then the interface alt setting, then the
        // class-specific sequence
        engine
            .control(
                devid,
                SetupPacket::set_configuration(config.configuration_value),
                &[],
                deadline,
            )
            .await?;
        engine
            .control(
                devid,
                SetupPacket::set_interface(endpoints.interface_number, endpoints.alt_setting),
                &[],
                deadline,
            )
            .await?;

        let control_interface = config
            .communications_interface()
            .map(|itf| itf.interface_number)
            .unwrap_or(endpoints.interface_number);
        for request in &self.class_setup {
            let setup = SetupPacket {
                request_type: request_type::HOST_TO_DEVICE
                    | request_type::TYPE_CLASS
                    | request_type::RECIPIENT_INTERFACE,
                request: request.request,
                value: request.value,
                index: control_interface as u16,
                length: request.data.len() as u16,
            };
            engine.control(devid, setup, &request.data, deadline).await?;
        }

        info!("{} is ready", remote.busid);
        Ok(Connection::new(
            engine.clone(),
            AttachedDevice {
                remote,
                hardware_id,
                devid,
                device_descriptor,
                endpoints,
            },
        ))
    }

    /// All connections whose device matches `device`, in attach order
    ///
    /// Several attached devices can share a vendor/product id; disambiguate
    /// with [Connection::busid].
    pub fn get_connection(&mut self, device: &HardwareID) -> Vec<&mut Connection> {
        self.connections
            .iter_mut()
            .filter(|connection| connection.hardware_id() == *device)
            .collect()
    }

    /// Drop the connections of every attached device matching `device`
    pub fn detach(&mut self, device: &HardwareID) {
        let before = self.connections.len();
        self.connections
            .retain(|connection| connection.hardware_id() != *device);
        debug!("detached {} connections", before - self.connections.len());
    }

    /// Tear the whole session down, faulting any suspended caller
    pub async fn shutdown(&mut self) {
        self.connections.clear();
        if let Some(engine) = self.engine.take() {
            engine.shutdown().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.socket = None;
        debug!("session to {}:{} shut down", self.host, self.port);
    }
}
