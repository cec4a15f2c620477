//! A scripted usbipd server for exercising the client end to end
//!
//! Serves simulated CDC ACM devices over real TCP sockets: answers devlist
//! and import requests, replays descriptors on endpoint 0, acknowledges bulk
//! OUT traffic and feeds bulk IN reads from a per-device queue. Reads with an
//! empty queue are left unanswered so deadline and unlink paths can be
//! exercised; the reserved busid "99-99" always refuses import.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const REJECTED_BUSID: &str = "99-99";

/// A bulk OUT transfer observed by the server
#[derive(Clone, Debug)]
pub struct SeenSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub ep: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct MockDevice {
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub vid: u16,
    pub pid: u16,
    pub bulk_in_queue: VecDeque<Vec<u8>>,
    /// When set, an unlinked pending read is answered late with this payload
    /// after the RET_UNLINK, as if it had completed concurrently
    pub late_reply: Option<Vec<u8>>,
}

impl MockDevice {
    pub fn new(busid: &str, busnum: u32, devnum: u32, vid: u16, pid: u16) -> Self {
        Self {
            busid: busid.to_string(),
            busnum,
            devnum,
            vid,
            pid,
            ..Self::default()
        }
    }

    fn devid(&self) -> u32 {
        self.busnum << 16 | self.devnum
    }

    fn device_descriptor(&self) -> Vec<u8> {
        vec![
            0x12, 0x01, // bLength, DEVICE
            0x00, 0x02, // bcdUSB 2.0
            0x02, 0x00, 0x00, // class, subclass, protocol
            0x40, // bMaxPacketSize0
            self.vid as u8,
            (self.vid >> 8) as u8,
            self.pid as u8,
            (self.pid >> 8) as u8,
            0x00, 0x01, // bcdDevice
            0x01, 0x02, 0x03, // strings
            0x01, // bNumConfigurations
        ]
    }

    /// Communications interface 0 with its functional records and interrupt
    /// endpoint, data interface 1 with the bulk pair 0x81/0x02
    fn config_descriptor(&self) -> Vec<u8> {
        let mut desc = vec![
            0x09, 0x02, 0x00, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32,
        ];
        desc.extend_from_slice(&[0x09, 0x04, 0x00, 0x00, 0x01, 0x02, 0x02, 0x00, 0x00]);
        desc.extend_from_slice(&[0x05, 0x24, 0x00, 0x10, 0x01]); // header, CDC 1.2
        desc.extend_from_slice(&[0x04, 0x24, 0x02, 0x02]); // ACM
        desc.extend_from_slice(&[0x05, 0x24, 0x06, 0x00, 0x01]); // union 0/1
        desc.extend_from_slice(&[0x07, 0x05, 0x83, 0x03, 0x08, 0x00, 0x0A]);
        desc.extend_from_slice(&[0x09, 0x04, 0x01, 0x00, 0x02, 0x0A, 0x00, 0x00, 0x00]);
        desc.extend_from_slice(&[0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00]);
        desc.extend_from_slice(&[0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00]);
        let total = desc.len() as u16;
        desc[2] = total as u8;
        desc[3] = (total >> 8) as u8;
        desc
    }

    fn record(&self, with_interfaces: bool) -> Vec<u8> {
        let mut rec = vec![];
        let mut path = format!("/sys/devices/mock/usb/{}", self.busid).into_bytes();
        path.resize(256, 0);
        rec.extend_from_slice(&path);
        let mut busid = self.busid.clone().into_bytes();
        busid.resize(32, 0);
        rec.extend_from_slice(&busid);
        rec.extend_from_slice(&self.busnum.to_be_bytes());
        rec.extend_from_slice(&self.devnum.to_be_bytes());
        rec.extend_from_slice(&3u32.to_be_bytes()); // high speed
        rec.extend_from_slice(&self.vid.to_be_bytes());
        rec.extend_from_slice(&self.pid.to_be_bytes());
        rec.extend_from_slice(&0x0100u16.to_be_bytes());
        rec.extend_from_slice(&[0x02, 0x00, 0x00, 0x01, 0x01, 0x02]);
        if with_interfaces {
            rec.extend_from_slice(&[0x02, 0x02, 0x00, 0x00]);
            rec.extend_from_slice(&[0x0A, 0x00, 0x00, 0x00]);
        }
        rec
    }
}

#[derive(Default)]
pub struct ServerState {
    pub devices: Vec<MockDevice>,
    /// Bulk OUT submits in arrival order
    pub bulk_out: Vec<SeenSubmit>,
    /// Every CMD_SUBMIT seqnum in arrival order
    pub seqnums: Vec<u32>,
    /// Seqnums of CMD_UNLINK targets in arrival order
    pub unlinked: Vec<u32>,
    /// Bulk IN submits waiting for data: (devid, seqnum)
    pending_reads: Vec<(u32, u32)>,
}

impl ServerState {
    fn device_by_busid(&self, busid: &str) -> Option<&MockDevice> {
        self.devices.iter().find(|dev| dev.busid == busid)
    }

    fn device_by_devid_mut(&mut self, devid: u32) -> Option<&mut MockDevice> {
        self.devices.iter_mut().find(|dev| dev.devid() == devid)
    }

    pub fn queue_bulk_in(&mut self, busid: &str, data: &[u8]) {
        let device = self
            .devices
            .iter_mut()
            .find(|dev| dev.busid == busid)
            .expect("unknown busid");
        device.bulk_in_queue.push_back(data.to_vec());
    }
}

pub struct MockUsbIpd {
    pub state: Arc<Mutex<ServerState>>,
    pub addr: SocketAddr,
}

impl MockUsbIpd {
    /// Bind a fresh port and serve connections until dropped
    pub async fn spawn(devices: Vec<MockDevice>) -> MockUsbIpd {
        let state = Arc::new(Mutex::new(ServerState {
            devices,
            ..ServerState::default()
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!("mock usbipd: connection from {}", peer);
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            let result = handler(socket, state).await;
                            debug!("mock usbipd: handler ended with {:?}", result);
                        });
                    }
                    Err(err) => {
                        warn!("mock usbipd: accept failed: {}", err);
                        break;
                    }
                }
            }
        });

        MockUsbIpd { state, addr }
    }

    pub fn queue_bulk_in(&self, busid: &str, data: &[u8]) {
        self.state.lock().unwrap().queue_bulk_in(busid, data);
    }

    pub fn set_late_reply(&self, busid: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let device = state
            .devices
            .iter_mut()
            .find(|dev| dev.busid == busid)
            .expect("unknown busid");
        device.late_reply = Some(data.to_vec());
    }

    pub fn bulk_out(&self) -> Vec<SeenSubmit> {
        self.state.lock().unwrap().bulk_out.clone()
    }

    pub fn seqnums(&self) -> Vec<u32> {
        self.state.lock().unwrap().seqnums.clone()
    }

    pub fn unlinked(&self) -> Vec<u32> {
        self.state.lock().unwrap().unlinked.clone()
    }
}

async fn write_ret_submit(
    socket: &mut TcpStream,
    seqnum: u32,
    status: i32,
    actual_length: u32,
    data: &[u8],
) -> std::io::Result<()> {
    socket.write_u32(3).await?;
    socket.write_u32(seqnum).await?;
    socket.write_u32(0).await?; // devid
    socket.write_u32(0).await?; // direction
    socket.write_u32(0).await?; // ep
    socket.write_i32(status).await?;
    socket.write_u32(actual_length).await?;
    socket.write_u32(0).await?; // start_frame
    socket.write_u32(0).await?; // number_of_packets
    socket.write_u32(0).await?; // error_count
    socket.write_all(&[0u8; 8]).await?;
    socket.write_all(data).await
}

async fn write_ret_unlink(socket: &mut TcpStream, seqnum: u32, status: i32) -> std::io::Result<()> {
    socket.write_u32(4).await?;
    socket.write_u32(seqnum).await?;
    socket.write_u32(0).await?;
    socket.write_u32(0).await?;
    socket.write_u32(0).await?;
    socket.write_i32(status).await?;
    socket.write_all(&[0u8; 24]).await
}

async fn handler(mut socket: TcpStream, state: Arc<Mutex<ServerState>>) -> std::io::Result<()> {
    loop {
        let mut code = [0u8; 4];
        if socket.read_exact(&mut code).await.is_err() {
            return Ok(());
        }
        match code {
            // OP_REQ_DEVLIST
            [0x01, 0x11, 0x80, 0x05] => {
                trace!("mock usbipd: OP_REQ_DEVLIST");
                let _status = socket.read_u32().await?;
                let records: Vec<Vec<u8>> = {
                    let state = state.lock().unwrap();
                    state.devices.iter().map(|dev| dev.record(true)).collect()
                };
                socket.write_u32(0x0111_0005).await?;
                socket.write_u32(0).await?;
                socket.write_u32(records.len() as u32).await?;
                for record in records {
                    socket.write_all(&record).await?;
                }
            }
            // OP_REQ_IMPORT
            [0x01, 0x11, 0x80, 0x03] => {
                let _status = socket.read_u32().await?;
                let mut busid_raw = [0u8; 32];
                socket.read_exact(&mut busid_raw).await?;
                let end = busid_raw.iter().position(|&b| b == 0).unwrap_or(32);
                let busid = String::from_utf8_lossy(&busid_raw[..end]).into_owned();
                trace!("mock usbipd: OP_REQ_IMPORT {}", busid);

                let record = {
                    let state = state.lock().unwrap();
                    if busid == REJECTED_BUSID {
                        None
                    } else {
                        state.device_by_busid(&busid).map(|dev| dev.record(false))
                    }
                };
                socket.write_u32(0x0111_0003).await?;
                match record {
                    Some(record) => {
                        socket.write_u32(0).await?;
                        socket.write_all(&record).await?;
                    }
                    None => socket.write_u32(1).await?,
                }
            }
            // USBIP_CMD_SUBMIT
            [0x00, 0x00, 0x00, 0x01] => {
                let seqnum = socket.read_u32().await?;
                let devid = socket.read_u32().await?;
                let direction = socket.read_u32().await?;
                let ep = socket.read_u32().await?;
                let _transfer_flags = socket.read_u32().await?;
                let transfer_buffer_length = socket.read_u32().await?;
                let _start_frame = socket.read_u32().await?;
                let _number_of_packets = socket.read_u32().await?;
                let _interval = socket.read_u32().await?;
                let mut setup = [0u8; 8];
                socket.read_exact(&mut setup).await?;

                let out_data = if direction == 0 {
                    let mut data = vec![0u8; transfer_buffer_length as usize];
                    socket.read_exact(&mut data).await?;
                    data
                } else {
                    vec![]
                };
                trace!(
                    "mock usbipd: CMD_SUBMIT #{} ep {} dir {} len {}",
                    seqnum,
                    ep,
                    direction,
                    transfer_buffer_length
                );
                state.lock().unwrap().seqnums.push(seqnum);

                if ep == 0 {
                    handle_control(
                        &mut socket,
                        &state,
                        seqnum,
                        devid,
                        &setup,
                        transfer_buffer_length,
                    )
                    .await?;
                } else if direction == 0 {
                    // bulk OUT: acknowledge and record
                    state.lock().unwrap().bulk_out.push(SeenSubmit {
                        seqnum,
                        devid,
                        ep,
                        data: out_data,
                    });
                    write_ret_submit(&mut socket, seqnum, 0, transfer_buffer_length, &[]).await?;
                } else {
                    // bulk IN: reply from the queue or leave pending
                    let data = {
                        let mut state = state.lock().unwrap();
                        match state
                            .device_by_devid_mut(devid)
                            .and_then(|dev| dev.bulk_in_queue.pop_front())
                        {
                            Some(data) => Some(data),
                            None => {
                                state.pending_reads.push((devid, seqnum));
                                None
                            }
                        }
                    };
                    if let Some(data) = data {
                        write_ret_submit(&mut socket, seqnum, 0, data.len() as u32, &data).await?;
                    }
                }
            }
            // USBIP_CMD_UNLINK
            [0x00, 0x00, 0x00, 0x02] => {
                let seqnum = socket.read_u32().await?;
                let devid = socket.read_u32().await?;
                let _direction = socket.read_u32().await?;
                let _ep = socket.read_u32().await?;
                let unlink_seqnum = socket.read_u32().await?;
                let mut padding = [0u8; 24];
                socket.read_exact(&mut padding).await?;
                trace!("mock usbipd: CMD_UNLINK #{} -> #{}", seqnum, unlink_seqnum);

                let (was_pending, late_reply) = {
                    let mut state = state.lock().unwrap();
                    let position = state
                        .pending_reads
                        .iter()
                        .position(|&(_, pending)| pending == unlink_seqnum);
                    if let Some(position) = position {
                        state.pending_reads.remove(position);
                    }
                    state.unlinked.push(unlink_seqnum);
                    let late_reply = state
                        .device_by_devid_mut(devid)
                        .and_then(|dev| dev.late_reply.take());
                    (position.is_some(), late_reply)
                };

                match late_reply {
                    Some(data) if was_pending => {
                        // pretend the read completed concurrently: claim the
                        // unlink came too late, then deliver the stale data
                        write_ret_unlink(&mut socket, seqnum, 0).await?;
                        write_ret_submit(&mut socket, unlink_seqnum, 0, data.len() as u32, &data)
                            .await?;
                    }
                    _ => write_ret_unlink(&mut socket, seqnum, -104).await?,
                }
            }
            other => {
                warn!("mock usbipd: unknown packet {:02x?}", other);
                return Ok(());
            }
        }
    }
}

async fn handle_control(
    socket: &mut TcpStream,
    state: &Arc<Mutex<ServerState>>,
    seqnum: u32,
    devid: u32,
    setup: &[u8; 8],
    transfer_buffer_length: u32,
) -> std::io::Result<()> {
    let request_type = setup[0];
    let request = setup[1];
    let value = u16::from_le_bytes([setup[2], setup[3]]);
    let length = u16::from_le_bytes([setup[6], setup[7]]);

    // GET_DESCRIPTOR
    if request_type == 0x80 && request == 0x06 {
        let descriptor = {
            let state = state.lock().unwrap();
            let device = state.devices.iter().find(|dev| dev.devid() == devid);
            match (device, (value >> 8) as u8) {
                (Some(dev), 0x01) => dev.device_descriptor(),
                (Some(dev), 0x02) => dev.config_descriptor(),
                (_, 0x03) => vec![0x04, 0x03, 0x09, 0x04],
                _ => vec![],
            }
        };
        let mut reply = descriptor;
        reply.truncate(length as usize);
        return write_ret_submit(socket, seqnum, 0, reply.len() as u32, &reply).await;
    }

    // SET_CONFIGURATION, SET_INTERFACE and class requests succeed silently
    write_ret_submit(socket, seqnum, 0, transfer_buffer_length, &[]).await
}
