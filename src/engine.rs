//! URB transaction engine
//!
//! Owns both halves of the server socket once a session enters the command
//! phase. Callers submit URBs and suspend on a per-seqnum rendezvous; a
//! background task reassembles RET_SUBMIT/RET_UNLINK frames from the read
//! half and wakes the matching waiter. The engine is the only writer of the
//! socket and the only owner of the seqnum counter and in-flight table.

use super::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Completion of a submitted URB as reported by RET_SUBMIT
#[derive(Debug)]
pub struct UrbCompletion {
    pub status: i32,
    pub data: Vec<u8>,
}

enum Completion {
    Ret(UrbCompletion),
    Unlinked,
}

struct Pending {
    direction: Direction,
    waiter: Option<oneshot::Sender<Completion>>,
}

#[derive(Default)]
struct Tables {
    /// Submitted URBs waiting for their RET_SUBMIT, keyed by seqnum
    inflight: HashMap<u32, Pending>,
    /// Seqnum of an issued CMD_UNLINK -> seqnum of the URB it targets
    unlinks: HashMap<u32, u32>,
    /// URBs removed by unlink or deadline; a late RET_SUBMIT for these is
    /// drained off the wire and dropped
    unlinked: HashMap<u32, Direction>,
}

struct EngineWriter {
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    /// Monotonic, starts at 1, never reused within a connection
    next_seqnum: u32,
}

impl EngineWriter {
    fn allocate_seqnum(&mut self) -> Result<u32> {
        if self.next_seqnum == u32::MAX {
            return Err(Error::SeqnumExhausted);
        }
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        Ok(seqnum)
    }
}

pub struct UrbEngine {
    writer: Mutex<EngineWriter>,
    tables: StdMutex<Tables>,
    closed: AtomicBool,
}

impl UrbEngine {
    /// Take ownership of the socket halves and spawn the demultiplexing task
    pub fn start<R, W>(reader: R, writer: W) -> (Arc<UrbEngine>, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let engine = Arc::new(UrbEngine {
            writer: Mutex::new(EngineWriter {
                sink: Box::new(writer),
                next_seqnum: 1,
            }),
            tables: StdMutex::new(Tables::default()),
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(Self::reader_loop(engine.clone(), Box::new(reader)));
        (engine, task)
    }

    /// Submit a bulk OUT transfer; returns its seqnum once the frame has been
    /// handed to the transport
    pub async fn submit_out(&self, devid: u32, ep: u32, data: &[u8]) -> Result<u32> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let mut writer = self.writer.lock().await;
        let seqnum = match writer.allocate_seqnum() {
            Ok(seqnum) => seqnum,
            Err(err) => {
                drop(writer);
                self.fault_all();
                return Err(err);
            }
        };
        self.tables.lock().unwrap().inflight.insert(
            seqnum,
            Pending {
                direction: Direction::Out,
                waiter: None,
            },
        );
        let frame = UsbIpRequest::CmdSubmit {
            header: UsbIpHeaderBasic {
                command: USBIP_CMD_SUBMIT,
                seqnum,
                devid,
                direction: Direction::Out as u32,
                ep,
            },
            transfer_flags: 0,
            transfer_buffer_length: data.len() as u32,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
            data: data.to_vec(),
        };
        trace!("CMD_SUBMIT #{} OUT ep {} ({} bytes)", seqnum, ep, data.len());
        if let Err(err) = writer.sink.write_all(&frame.to_bytes()).await {
            self.tables.lock().unwrap().inflight.remove(&seqnum);
            return Err(Error::SendFailed(err));
        }
        Ok(seqnum)
    }

    /// Submit a bulk IN transfer and suspend until the payload arrives
    ///
    /// A deadline elapsing unlinks the transaction on the server and returns
    /// [Error::ReadTimeout]; a late completion is dropped by the reader.
    pub async fn submit_in(
        &self,
        devid: u32,
        ep: u32,
        length: u32,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        self.submit_awaited(devid, ep, Direction::In, length, [0; 8], &[], deadline)
            .await
    }

    /// Issue a control transfer on endpoint 0 and await its completion
    pub async fn control(
        &self,
        devid: u32,
        setup: SetupPacket,
        data: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let direction = setup.direction();
        let length = match direction {
            Direction::Out => data.len() as u32,
            Direction::In => setup.length as u32,
        };
        self.submit_awaited(devid, 0, direction, length, setup.to_bytes(), data, deadline)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_awaited(
        &self,
        devid: u32,
        ep: u32,
        direction: Direction,
        transfer_buffer_length: u32,
        setup: [u8; 8],
        data: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let (tx, mut rx) = oneshot::channel();
        let seqnum;
        {
            let mut writer = self.writer.lock().await;
            seqnum = match writer.allocate_seqnum() {
                Ok(seqnum) => seqnum,
                Err(err) => {
                    drop(writer);
                    self.fault_all();
                    return Err(err);
                }
            };
            self.tables.lock().unwrap().inflight.insert(
                seqnum,
                Pending {
                    direction,
                    waiter: Some(tx),
                },
            );
            let frame = UsbIpRequest::CmdSubmit {
                header: UsbIpHeaderBasic {
                    command: USBIP_CMD_SUBMIT,
                    seqnum,
                    devid,
                    direction: direction as u32,
                    ep,
                },
                transfer_flags: if direction == Direction::In { URB_DIR_IN } else { 0 },
                transfer_buffer_length,
                start_frame: 0,
                number_of_packets: 0,
                interval: 0,
                setup,
                data: data.to_vec(),
            };
            trace!("CMD_SUBMIT #{} {:?} ep {}", seqnum, direction, ep);
            if let Err(err) = writer.sink.write_all(&frame.to_bytes()).await {
                self.tables.lock().unwrap().inflight.remove(&seqnum);
                return Err(Error::SendFailed(err));
            }
        }

        match timeout(deadline, &mut rx).await {
            Ok(Ok(Completion::Ret(completion))) => {
                if completion.status != 0 {
                    Err(Error::UrbFailed {
                        status: completion.status,
                    })
                } else {
                    Ok(completion.data)
                }
            }
            Ok(Ok(Completion::Unlinked)) => Err(Error::Unlinked),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                // the completion may have raced the deadline
                if let Ok(Completion::Ret(completion)) = rx.try_recv() {
                    if completion.status != 0 {
                        return Err(Error::UrbFailed {
                            status: completion.status,
                        });
                    }
                    return Ok(completion.data);
                }
                debug!("deadline elapsed for #{}, unlinking", seqnum);
                {
                    let mut tables = self.tables.lock().unwrap();
                    if tables.inflight.remove(&seqnum).is_some() {
                        tables.unlinked.insert(seqnum, direction);
                    }
                }
                self.send_unlink(devid, seqnum).await.ok();
                Err(Error::ReadTimeout)
            }
        }
    }

    /// Cancel an in-flight transaction and wake its suspended caller
    pub async fn unlink(&self, devid: u32, seqnum: u32) -> Result<()> {
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            tables.inflight.remove(&seqnum).map(|pending| {
                tables.unlinked.insert(seqnum, pending.direction);
                pending
            })
        };
        if let Some(pending) = removed {
            if let Some(waiter) = pending.waiter {
                let _ = waiter.send(Completion::Unlinked);
            }
            self.send_unlink(devid, seqnum).await?;
        }
        Ok(())
    }

    async fn send_unlink(&self, devid: u32, target: u32) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let seqnum = writer.allocate_seqnum()?;
        self.tables.lock().unwrap().unlinks.insert(seqnum, target);
        let frame = UsbIpRequest::CmdUnlink {
            header: UsbIpHeaderBasic {
                command: USBIP_CMD_UNLINK,
                seqnum,
                devid,
                direction: 0,
                ep: 0,
            },
            unlink_seqnum: target,
        };
        trace!("CMD_UNLINK #{} targeting #{}", seqnum, target);
        writer
            .sink
            .write_all(&frame.to_bytes())
            .await
            .map_err(Error::SendFailed)
    }

    /// Number of transactions awaiting a response
    pub fn pending(&self) -> usize {
        self.tables.lock().unwrap().inflight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the engine dead and fault every suspended caller with
    /// [Error::Disconnected]
    pub fn fault_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut tables = self.tables.lock().unwrap();
        // dropping the waiters wakes the receivers with a channel error
        tables.inflight.clear();
        tables.unlinks.clear();
        tables.unlinked.clear();
    }

    async fn reader_loop(engine: Arc<UrbEngine>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
        loop {
            let mut block = [0u8; CMD_HEADER_LEN];
            if let Err(err) = reader.read_exact(&mut block).await {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    info!("server closed the connection");
                } else {
                    warn!("transport read failed: {}", err);
                }
                break;
            }
            let frame = match CmdFrame::from_bytes(&block) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("cannot keep framing after {}", err);
                    break;
                }
            };
            match frame {
                CmdFrame::RetSubmit(prefix) => {
                    if engine.handle_ret_submit(prefix, &mut reader).await.is_err() {
                        break;
                    }
                }
                CmdFrame::RetUnlink(ret) => engine.handle_ret_unlink(ret),
            }
        }
        engine.fault_all();
    }

    async fn handle_ret_submit(
        &self,
        prefix: RetSubmitPrefix,
        reader: &mut Box<dyn AsyncRead + Send + Unpin>,
    ) -> std::io::Result<()> {
        let seqnum = prefix.header.seqnum;
        // the server zeroes the direction field; the in-flight table tells us
        // whether payload bytes follow this header
        let direction = {
            let tables = self.tables.lock().unwrap();
            tables
                .inflight
                .get(&seqnum)
                .map(|pending| pending.direction)
                .or_else(|| tables.unlinked.get(&seqnum).copied())
        }
        .unwrap_or(if prefix.header.direction == Direction::In as u32 {
            Direction::In
        } else {
            Direction::Out
        });

        let mut payload = vec![];
        if direction == Direction::In && prefix.actual_length > 0 {
            payload = vec![0u8; prefix.actual_length as usize];
            reader.read_exact(&mut payload).await?;
        }
        trace!(
            "RET_SUBMIT #{} status {} ({} bytes)",
            seqnum,
            prefix.status,
            payload.len()
        );

        let mut tables = self.tables.lock().unwrap();
        if let Some(pending) = tables.inflight.remove(&seqnum) {
            match pending.waiter {
                Some(waiter) => {
                    let _ = waiter.send(Completion::Ret(UrbCompletion {
                        status: prefix.status,
                        data: payload,
                    }));
                }
                None => {
                    if prefix.status != 0 {
                        warn!("OUT urb #{} completed with status {}", seqnum, prefix.status);
                    }
                }
            }
        } else if tables.unlinked.remove(&seqnum).is_some() {
            warn!(
                "spurious response for unlinked seqnum {}, dropping {} bytes",
                seqnum,
                payload.len()
            );
        } else {
            warn!("spurious response with unknown seqnum {}", seqnum);
        }
        Ok(())
    }

    fn handle_ret_unlink(&self, ret: RetUnlink) {
        let mut tables = self.tables.lock().unwrap();
        match tables.unlinks.remove(&ret.header.seqnum) {
            Some(target) => {
                // nonzero status: the urb was reaped before completing, so no
                // RET_SUBMIT will ever arrive for it
                if ret.status != 0 {
                    tables.unlinked.remove(&target);
                }
                debug!("unlink of #{} acknowledged, status {}", target, ret.status);
            }
            None => warn!("RET_UNLINK for unknown seqnum {}", ret.header.seqnum),
        }
    }

    /// Flush and close the write half
    pub async fn shutdown(&self) {
        self.fault_all();
        let mut writer = self.writer.lock().await;
        writer.sink.shutdown().await.ok();
    }

    #[cfg(test)]
    pub(crate) async fn set_next_seqnum(&self, value: u32) {
        self.writer.lock().await.next_seqnum = value;
    }
}
