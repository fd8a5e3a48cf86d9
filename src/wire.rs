//! Wire format handling for the broker coordination protocol.
//!
//! Each frame on the broker socket is a 2-byte big-endian length followed
//! by that many payload bytes; several frames may arrive in one read:
//!
//! ```text
//! | len-1 (2 bytes) | payload-1 (len-1 bytes) | len-2 | payload-2 | ..
//! ```
//!
//! The payload starts with a fixed header and carries `record_count`
//! typed records:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message Type                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Data Length         |          Record Count         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Records (Data Length bytes)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All integers are big-endian; addresses travel in network byte order.
//! Bulk add/del messages share one header and apply all-or-nothing: any
//! record that fails to decode fails the whole message.

use std::net::Ipv4Addr;

use crate::types::{
    Flow, InterfaceName, MlagRole, PeerState, VrfName, INTF_NAME_LEN, VRF_NAME_LEN,
};
use crate::Error;

/// Size of the per-frame length prefix in bytes.
pub const FRAME_LEN_SIZE: usize = 2;

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size per frame.
pub const MAX_PAYLOAD_SIZE: usize = 2048;

/// Filler word the original broker protocol carries in mroute records.
const MROUTE_RESERVED: u32 = 0xa5a5;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    StatusUpdate = 1,
    MrouteAdd = 2,
    MrouteDel = 3,
    MrouteAddBulk = 4,
    MrouteDelBulk = 5,
    PimStatusUpdate = 6,
    Register = 7,
    Deregister = 8,
}

impl MessageType {
    /// Returns this type's bit in the registration capability mask.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl TryFrom<u32> for MessageType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::StatusUpdate),
            2 => Ok(MessageType::MrouteAdd),
            3 => Ok(MessageType::MrouteDel),
            4 => Ok(MessageType::MrouteAddBulk),
            5 => Ok(MessageType::MrouteDelBulk),
            6 => Ok(MessageType::PimStatusUpdate),
            7 => Ok(MessageType::Register),
            8 => Ok(MessageType::Deregister),
            _ => Err(Error::Protocol(format!("unknown message type: {}", value))),
        }
    }
}

/// Broker status record: advisory role plus peer process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// MLAG role of this instance, as the broker sees it.
    pub my_role: MlagRole,
    /// Process state of the peer routing instance.
    pub peer_state: PeerState,
}

/// One flow-interface advertisement from a routing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrouteAdd {
    /// VRF the flow lives in.
    pub vrf_name: VrfName,
    /// The (source, group) pair.
    pub flow: Flow,
    /// Sender's route metric to the multicast tree root.
    pub cost_to_rp: u32,
    /// Whether the sender is the Designated Router on its interface.
    pub am_i_dr: bool,
    /// Whether the sender has dual-active configured on its interface.
    pub am_i_dual_active: bool,
    /// Numeric VRF identifier.
    pub vrf_id: u32,
    /// Interface the flow is bound to.
    pub intf_name: InterfaceName,
}

/// Withdrawal of a flow-interface advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrouteDel {
    /// VRF the flow lives in.
    pub vrf_name: VrfName,
    /// The (source, group) pair.
    pub flow: Flow,
    /// Numeric VRF identifier.
    pub vrf_id: u32,
    /// Interface the flow was bound to.
    pub intf_name: InterfaceName,
}

/// PIM-level status record from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PimStatusUpdate {
    /// Peer switch daemon state.
    pub switch_state: u32,
    /// Peer dual-active interface state.
    pub interface_state: u32,
}

/// A coordination message exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Broker connectivity / role status.
    StatusUpdate(StatusUpdate),
    /// Single flow-interface advertisement.
    MrouteAdd(MrouteAdd),
    /// Single flow-interface withdrawal.
    MrouteDel(MrouteDel),
    /// Bulk advertisement, applied all-or-nothing.
    MrouteAddBulk(Vec<MrouteAdd>),
    /// Bulk withdrawal, applied all-or-nothing.
    MrouteDelBulk(Vec<MrouteDel>),
    /// PIM status from the peer instance.
    PimStatusUpdate(PimStatusUpdate),
    /// Registration: one mask bit per message type the client wants.
    Register {
        /// Capability bitmask, see [`MessageType::bit`].
        capability_mask: u32,
    },
    /// De-registration; the broker drops this client's state.
    Deregister,
}

impl Message {
    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::StatusUpdate(_) => MessageType::StatusUpdate,
            Message::MrouteAdd(_) => MessageType::MrouteAdd,
            Message::MrouteDel(_) => MessageType::MrouteDel,
            Message::MrouteAddBulk(_) => MessageType::MrouteAddBulk,
            Message::MrouteDelBulk(_) => MessageType::MrouteDelBulk,
            Message::PimStatusUpdate(_) => MessageType::PimStatusUpdate,
            Message::Register { .. } => MessageType::Register,
            Message::Deregister => MessageType::Deregister,
        }
    }

    /// Encodes the message into a complete frame (length prefix included).
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let (records, record_count) = self.encode_records()?;
        frame_payload(self.message_type(), &records, record_count)
    }

    fn encode_records(&self) -> Result<(Vec<u8>, u16), Error> {
        let mut buf = Vec::new();
        let count = match self {
            Message::StatusUpdate(s) => {
                put_u32(&mut buf, u32::from(s.my_role));
                put_u32(&mut buf, u32::from(s.peer_state));
                1
            }
            Message::MrouteAdd(rec) => {
                put_mroute_add(&mut buf, rec);
                1
            }
            Message::MrouteDel(rec) => {
                put_mroute_del(&mut buf, rec);
                1
            }
            Message::MrouteAddBulk(recs) => {
                for rec in recs {
                    put_mroute_add(&mut buf, rec);
                }
                bulk_count(recs.len())?
            }
            Message::MrouteDelBulk(recs) => {
                for rec in recs {
                    put_mroute_del(&mut buf, rec);
                }
                bulk_count(recs.len())?
            }
            Message::PimStatusUpdate(s) => {
                put_u32(&mut buf, s.switch_state);
                put_u32(&mut buf, s.interface_state);
                1
            }
            Message::Register { capability_mask } => {
                put_u32(&mut buf, *capability_mask);
                1
            }
            Message::Deregister => 0,
        };
        Ok((buf, count))
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns the message and the number of bytes consumed.
    /// [`Error::Incomplete`] means more data is needed; any other error
    /// means the frame is unusable and must be dropped.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
        if buf.len() < FRAME_LEN_SIZE {
            return Err(Error::Incomplete);
        }
        let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if frame_len > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!(
                "frame length {} exceeds limit of {} bytes",
                frame_len, MAX_PAYLOAD_SIZE
            )));
        }
        if buf.len() < FRAME_LEN_SIZE + frame_len {
            return Err(Error::Incomplete);
        }
        let payload = &buf[FRAME_LEN_SIZE..FRAME_LEN_SIZE + frame_len];
        let message = Self::decode_payload(payload)?;
        Ok((message, FRAME_LEN_SIZE + frame_len))
    }

    /// Decodes a frame payload (header + records, without the length prefix).
    pub fn decode_payload(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < HEADER_SIZE {
            return Err(Error::Protocol("header truncated".into()));
        }

        let msg_type = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let msg_type = MessageType::try_from(msg_type)?;
        let data_len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
        let record_count = u16::from_be_bytes([payload[6], payload[7]]) as usize;

        if payload.len() - HEADER_SIZE != data_len {
            return Err(Error::Protocol(format!(
                "header says {} data bytes, frame carries {}",
                data_len,
                payload.len() - HEADER_SIZE
            )));
        }

        let mut cur = Cursor::new(&payload[HEADER_SIZE..]);
        let message = match msg_type {
            MessageType::StatusUpdate => {
                expect_count(record_count, 1)?;
                let my_role = MlagRole::try_from(cur.get_u32()?)?;
                let peer_state = PeerState::try_from(cur.get_u32()?)?;
                Message::StatusUpdate(StatusUpdate {
                    my_role,
                    peer_state,
                })
            }
            MessageType::MrouteAdd => {
                expect_count(record_count, 1)?;
                Message::MrouteAdd(get_mroute_add(&mut cur)?)
            }
            MessageType::MrouteDel => {
                expect_count(record_count, 1)?;
                Message::MrouteDel(get_mroute_del(&mut cur)?)
            }
            MessageType::MrouteAddBulk => {
                let mut recs = Vec::with_capacity(record_count);
                for _ in 0..record_count {
                    recs.push(get_mroute_add(&mut cur)?);
                }
                Message::MrouteAddBulk(recs)
            }
            MessageType::MrouteDelBulk => {
                let mut recs = Vec::with_capacity(record_count);
                for _ in 0..record_count {
                    recs.push(get_mroute_del(&mut cur)?);
                }
                Message::MrouteDelBulk(recs)
            }
            MessageType::PimStatusUpdate => {
                expect_count(record_count, 1)?;
                Message::PimStatusUpdate(PimStatusUpdate {
                    switch_state: cur.get_u32()?,
                    interface_state: cur.get_u32()?,
                })
            }
            MessageType::Register => {
                expect_count(record_count, 1)?;
                Message::Register {
                    capability_mask: cur.get_u32()?,
                }
            }
            MessageType::Deregister => {
                expect_count(record_count, 0)?;
                Message::Deregister
            }
        };

        if !cur.is_empty() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after last record",
                cur.remaining()
            )));
        }

        Ok(message)
    }
}

/// Wraps an opaque payload in a length-prefixed frame.
///
/// Used by the client relay path; the payload is not interpreted.
pub fn frame_raw(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Protocol(format!(
            "payload too long: {} bytes > maximum of {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_LEN_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn frame_payload(msg_type: MessageType, records: &[u8], record_count: u16) -> Result<Vec<u8>, Error> {
    let payload_len = HEADER_SIZE + records.len();
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(Error::Protocol(format!(
            "message too long: {} bytes > maximum of {} bytes",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_LEN_SIZE + payload_len);
    frame.extend_from_slice(&(payload_len as u16).to_be_bytes());
    frame.extend_from_slice(&(msg_type as u32).to_be_bytes());
    frame.extend_from_slice(&(records.len() as u16).to_be_bytes());
    frame.extend_from_slice(&record_count.to_be_bytes());
    frame.extend_from_slice(records);
    Ok(frame)
}

fn bulk_count(len: usize) -> Result<u16, Error> {
    u16::try_from(len).map_err(|_| Error::Protocol(format!("too many bulk records: {}", len)))
}

fn expect_count(got: usize, want: usize) -> Result<(), Error> {
    if got != want {
        return Err(Error::Protocol(format!(
            "record count {} where {} expected",
            got, want
        )));
    }
    Ok(())
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_addr(buf: &mut Vec<u8>, addr: Ipv4Addr) {
    // Network byte order on the wire.
    buf.extend_from_slice(&addr.octets());
}

fn put_fixed_str(buf: &mut Vec<u8>, s: &str, len: usize) {
    buf.extend_from_slice(s.as_bytes());
    buf.resize(buf.len() + (len - s.len()), 0);
}

fn put_mroute_add(buf: &mut Vec<u8>, rec: &MrouteAdd) {
    put_fixed_str(buf, rec.vrf_name.as_str(), VRF_NAME_LEN);
    put_addr(buf, rec.flow.source);
    put_addr(buf, rec.flow.group);
    put_u32(buf, rec.cost_to_rp);
    put_u32(buf, MROUTE_RESERVED);
    buf.push(rec.am_i_dr as u8);
    buf.push(rec.am_i_dual_active as u8);
    put_u32(buf, rec.vrf_id);
    put_fixed_str(buf, rec.intf_name.as_str(), INTF_NAME_LEN);
}

fn put_mroute_del(buf: &mut Vec<u8>, rec: &MrouteDel) {
    put_fixed_str(buf, rec.vrf_name.as_str(), VRF_NAME_LEN);
    put_addr(buf, rec.flow.source);
    put_addr(buf, rec.flow.group);
    put_u32(buf, MROUTE_RESERVED);
    put_u32(buf, rec.vrf_id);
    put_fixed_str(buf, rec.intf_name.as_str(), INTF_NAME_LEN);
}

fn get_mroute_add(cur: &mut Cursor<'_>) -> Result<MrouteAdd, Error> {
    let vrf_name = cur.get_fixed_str(VRF_NAME_LEN)?;
    let source = cur.get_addr()?;
    let group = cur.get_addr()?;
    let cost_to_rp = cur.get_u32()?;
    let _reserved = cur.get_u32()?;
    let am_i_dr = cur.get_u8()? != 0;
    let am_i_dual_active = cur.get_u8()? != 0;
    let vrf_id = cur.get_u32()?;
    let intf_name = cur.get_fixed_str(INTF_NAME_LEN)?;

    Ok(MrouteAdd {
        vrf_name: VrfName::new(vrf_name)?,
        flow: Flow::new(source, group),
        cost_to_rp,
        am_i_dr,
        am_i_dual_active,
        vrf_id,
        intf_name: InterfaceName::new(intf_name)?,
    })
}

fn get_mroute_del(cur: &mut Cursor<'_>) -> Result<MrouteDel, Error> {
    let vrf_name = cur.get_fixed_str(VRF_NAME_LEN)?;
    let source = cur.get_addr()?;
    let group = cur.get_addr()?;
    let _reserved = cur.get_u32()?;
    let vrf_id = cur.get_u32()?;
    let intf_name = cur.get_fixed_str(INTF_NAME_LEN)?;

    Ok(MrouteDel {
        vrf_name: VrfName::new(vrf_name)?,
        flow: Flow::new(source, group),
        vrf_id,
        intf_name: InterfaceName::new(intf_name)?,
    })
}

/// Bounds-checked reader over a record block. Every accessor fails with a
/// protocol error instead of reading past the block end.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::Protocol(format!(
                "record truncated: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_addr(&mut self) -> Result<Ipv4Addr, Error> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn get_fixed_str(&mut self, len: usize) -> Result<String, Error> {
        let b = self.take(len)?;
        let end = b.iter().position(|&c| c == 0).unwrap_or(len);
        let s = std::str::from_utf8(&b[..end])
            .map_err(|_| Error::Protocol("name field is not valid UTF-8".into()))?;
        Ok(s.to_string())
    }
}
