//! Wire protocol types, constants, and utilities
//!
//! Every multi-byte field is big-endian on the wire. The byte layout is
//! fixed by the deployed protocol version and must not change, or hosts
//! built from different implementations stop interoperating.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol constants
pub mod constants {
    pub const PROTOCOL_MINIMUM_MTU: u32 = 576;
    pub const PROTOCOL_MAXIMUM_MTU: u32 = 4096;
    pub const PROTOCOL_MAXIMUM_PACKET_COMMANDS: usize = 32;
    pub const PROTOCOL_MINIMUM_WINDOW_SIZE: u32 = 4096;
    pub const PROTOCOL_MAXIMUM_WINDOW_SIZE: u32 = 65536;
    pub const PROTOCOL_MINIMUM_CHANNEL_COUNT: usize = 1;
    pub const PROTOCOL_MAXIMUM_CHANNEL_COUNT: usize = 255;
    pub const PROTOCOL_MAXIMUM_PEER_ID: u16 = 0xFFF;
    pub const PROTOCOL_MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

    pub const COMMAND_NONE: u8 = 0;
    pub const COMMAND_ACKNOWLEDGE: u8 = 1;
    pub const COMMAND_CONNECT: u8 = 2;
    pub const COMMAND_VERIFY_CONNECT: u8 = 3;
    pub const COMMAND_DISCONNECT: u8 = 4;
    pub const COMMAND_PING: u8 = 5;
    pub const COMMAND_SEND_RELIABLE: u8 = 6;
    pub const COMMAND_SEND_UNRELIABLE: u8 = 7;
    pub const COMMAND_SEND_FRAGMENT: u8 = 8;
    pub const COMMAND_SEND_UNSEQUENCED: u8 = 9;
    pub const COMMAND_BANDWIDTH_LIMIT: u8 = 10;
    pub const COMMAND_THROTTLE_CONFIGURE: u8 = 11;
    pub const COMMAND_SEND_UNRELIABLE_FRAGMENT: u8 = 12;
    pub const COMMAND_COUNT: u8 = 13;
    pub const COMMAND_MASK: u8 = 0x0F;

    pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
    pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;

    pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 14;
    pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_SENT_TIME;
    pub const HEADER_SESSION_MASK: u16 = 3 << 12;
    pub const HEADER_SESSION_SHIFT: u16 = 12;
}

use constants::*;

/// Reliable/unreliable sequence number type
pub type SeqNum = u16;

/// Millisecond timestamp type (wrapping)
pub type Timestamp = u32;

/// Per-command wire sizes indexed by command number (header included).
const COMMAND_SIZES: [usize; COMMAND_COUNT as usize] = [
    0,  // none
    8,  // acknowledge
    48, // connect
    44, // verify connect
    8,  // disconnect
    4,  // ping
    6,  // send reliable
    8,  // send unreliable
    24, // send fragment
    8,  // send unsequenced
    12, // bandwidth limit
    16, // throttle configure
    24, // send unreliable fragment
];

/// Wire size of a command (including its header), or 0 for an unknown one.
pub fn command_size(command: u8) -> usize {
    let number = command & COMMAND_MASK;

    if number >= COMMAND_COUNT {
        return 0;
    }

    COMMAND_SIZES[number as usize]
}

/// Datagram-level header preceding all commands.
///
/// `peer_id` carries the target peer id in its low 12 bits, a 2-bit session
/// id, and the sent-time-present flag; `sent_time` is only on the wire when
/// that flag is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolHeader {
    pub peer_id: u16,
    pub sent_time: Option<u16>,
}

impl ProtocolHeader {
    /// Encode the header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.peer_id);

        if let Some(sent_time) = self.sent_time {
            buf.put_u16(sent_time);
        }
    }

    /// Decode a header from `buf`, consuming 2 or 4 bytes.
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }

        let peer_id = buf.get_u16();

        let sent_time = if peer_id & HEADER_FLAG_SENT_TIME != 0 {
            if buf.len() < 2 {
                return None;
            }

            Some(buf.get_u16())
        } else {
            None
        };

        Some(Self { peer_id, sent_time })
    }

    /// Session id bits carried in the header.
    pub fn session_id(&self) -> u8 {
        ((self.peer_id & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8
    }

    /// Target peer id with flag and session bits stripped.
    pub fn target_peer_id(&self) -> u16 {
        self.peer_id & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK)
    }
}

/// Header shared by every command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandHeader {
    /// Command number in the low 4 bits plus acknowledge/unsequenced flags
    pub command: u8,
    /// Target channel, or 0xFF for connection-level commands
    pub channel_id: u8,
    pub reliable_sequence_number: SeqNum,
}

impl CommandHeader {
    pub const SIZE: usize = 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command);
        buf.put_u8(self.channel_id);
        buf.put_u16(self.reliable_sequence_number);
    }

    fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            command: buf.get_u8(),
            channel_id: buf.get_u8(),
            reliable_sequence_number: buf.get_u16(),
        })
    }
}

/// Body of a connect request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectCommand {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
    pub data: u32,
}

/// Body of a connect verification, echoing the negotiated parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyConnectCommand {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

/// Body shared by reliable and unreliable fragment commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FragmentCommand {
    pub start_sequence_number: SeqNum,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

/// Typed command body; the payload of send commands travels separately,
/// immediately after the command on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    Acknowledge {
        received_reliable_sequence_number: SeqNum,
        received_sent_time: u16,
    },
    Connect(ConnectCommand),
    VerifyConnect(VerifyConnectCommand),
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: SeqNum,
        data_length: u16,
    },
    SendFragment(FragmentCommand),
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
    SendUnreliableFragment(FragmentCommand),
}

/// A full protocol command: header plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    /// Create a command for `channel_id` with the number and flags in
    /// `command` and the given body.
    pub fn new(command: u8, channel_id: u8, body: CommandBody) -> Self {
        Self {
            header: CommandHeader {
                command,
                channel_id,
                reliable_sequence_number: 0,
            },
            body,
        }
    }

    /// Command number with flag bits stripped.
    pub fn number(&self) -> u8 {
        self.header.command & COMMAND_MASK
    }

    /// Whether the remote end must acknowledge this command.
    pub fn wants_acknowledge(&self) -> bool {
        self.header.command & COMMAND_FLAG_ACKNOWLEDGE != 0
    }

    /// Whether this command bypasses sequencing entirely.
    pub fn is_unsequenced(&self) -> bool {
        self.header.command & COMMAND_FLAG_UNSEQUENCED != 0
    }

    /// Wire size of this command, excluding any payload.
    pub fn size(&self) -> usize {
        command_size(self.header.command)
    }

    /// Encode header and body into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);

        match &self.body {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                buf.put_u16(*received_reliable_sequence_number);
                buf.put_u16(*received_sent_time);
            }
            CommandBody::Connect(c) => {
                buf.put_u16(c.outgoing_peer_id);
                buf.put_u8(c.incoming_session_id);
                buf.put_u8(c.outgoing_session_id);
                buf.put_u32(c.mtu);
                buf.put_u32(c.window_size);
                buf.put_u32(c.channel_count);
                buf.put_u32(c.incoming_bandwidth);
                buf.put_u32(c.outgoing_bandwidth);
                buf.put_u32(c.packet_throttle_interval);
                buf.put_u32(c.packet_throttle_acceleration);
                buf.put_u32(c.packet_throttle_deceleration);
                buf.put_u32(c.connect_id);
                buf.put_u32(c.data);
            }
            CommandBody::VerifyConnect(c) => {
                buf.put_u16(c.outgoing_peer_id);
                buf.put_u8(c.incoming_session_id);
                buf.put_u8(c.outgoing_session_id);
                buf.put_u32(c.mtu);
                buf.put_u32(c.window_size);
                buf.put_u32(c.channel_count);
                buf.put_u32(c.incoming_bandwidth);
                buf.put_u32(c.outgoing_bandwidth);
                buf.put_u32(c.packet_throttle_interval);
                buf.put_u32(c.packet_throttle_acceleration);
                buf.put_u32(c.packet_throttle_deceleration);
                buf.put_u32(c.connect_id);
            }
            CommandBody::Disconnect { data } => {
                buf.put_u32(*data);
            }
            CommandBody::Ping => {}
            CommandBody::SendReliable { data_length } => {
                buf.put_u16(*data_length);
            }
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                buf.put_u16(*unreliable_sequence_number);
                buf.put_u16(*data_length);
            }
            CommandBody::SendFragment(c) | CommandBody::SendUnreliableFragment(c) => {
                buf.put_u16(c.start_sequence_number);
                buf.put_u16(c.data_length);
                buf.put_u32(c.fragment_count);
                buf.put_u32(c.fragment_number);
                buf.put_u32(c.total_length);
                buf.put_u32(c.fragment_offset);
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                buf.put_u16(*unsequenced_group);
                buf.put_u16(*data_length);
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
            }
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buf.put_u32(*packet_throttle_interval);
                buf.put_u32(*packet_throttle_acceleration);
                buf.put_u32(*packet_throttle_deceleration);
            }
        }
    }

    /// Decode one command (header and body, not the payload) from `buf`.
    ///
    /// Returns `None` on an unknown command number or short buffer; the
    /// caller drops the rest of the datagram in that case.
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        let header = CommandHeader::decode(buf)?;
        let number = header.command & COMMAND_MASK;
        let size = command_size(header.command);

        if size == 0 || buf.len() + CommandHeader::SIZE < size {
            return None;
        }

        let body = match number {
            COMMAND_ACKNOWLEDGE => CommandBody::Acknowledge {
                received_reliable_sequence_number: buf.get_u16(),
                received_sent_time: buf.get_u16(),
            },
            COMMAND_CONNECT => CommandBody::Connect(ConnectCommand {
                outgoing_peer_id: buf.get_u16(),
                incoming_session_id: buf.get_u8(),
                outgoing_session_id: buf.get_u8(),
                mtu: buf.get_u32(),
                window_size: buf.get_u32(),
                channel_count: buf.get_u32(),
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
                connect_id: buf.get_u32(),
                data: buf.get_u32(),
            }),
            COMMAND_VERIFY_CONNECT => CommandBody::VerifyConnect(VerifyConnectCommand {
                outgoing_peer_id: buf.get_u16(),
                incoming_session_id: buf.get_u8(),
                outgoing_session_id: buf.get_u8(),
                mtu: buf.get_u32(),
                window_size: buf.get_u32(),
                channel_count: buf.get_u32(),
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
                connect_id: buf.get_u32(),
            }),
            COMMAND_DISCONNECT => CommandBody::Disconnect {
                data: buf.get_u32(),
            },
            COMMAND_PING => CommandBody::Ping,
            COMMAND_SEND_RELIABLE => CommandBody::SendReliable {
                data_length: buf.get_u16(),
            },
            COMMAND_SEND_UNRELIABLE => CommandBody::SendUnreliable {
                unreliable_sequence_number: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            COMMAND_SEND_FRAGMENT => CommandBody::SendFragment(decode_fragment(buf)),
            COMMAND_SEND_UNSEQUENCED => CommandBody::SendUnsequenced {
                unsequenced_group: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            COMMAND_BANDWIDTH_LIMIT => CommandBody::BandwidthLimit {
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
            },
            COMMAND_THROTTLE_CONFIGURE => CommandBody::ThrottleConfigure {
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
            },
            COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                CommandBody::SendUnreliableFragment(decode_fragment(buf))
            }
            _ => return None,
        };

        Some(Self { header, body })
    }

    /// Payload length declared by a send command, 0 for control commands.
    pub fn data_length(&self) -> usize {
        match &self.body {
            CommandBody::SendReliable { data_length } => *data_length as usize,
            CommandBody::SendUnreliable { data_length, .. } => *data_length as usize,
            CommandBody::SendUnsequenced { data_length, .. } => *data_length as usize,
            CommandBody::SendFragment(c) | CommandBody::SendUnreliableFragment(c) => {
                c.data_length as usize
            }
            _ => 0,
        }
    }

    /// Command name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self.number() {
            COMMAND_ACKNOWLEDGE => "ACKNOWLEDGE",
            COMMAND_CONNECT => "CONNECT",
            COMMAND_VERIFY_CONNECT => "VERIFY_CONNECT",
            COMMAND_DISCONNECT => "DISCONNECT",
            COMMAND_PING => "PING",
            COMMAND_SEND_RELIABLE => "SEND_RELIABLE",
            COMMAND_SEND_UNRELIABLE => "SEND_UNRELIABLE",
            COMMAND_SEND_FRAGMENT => "SEND_FRAGMENT",
            COMMAND_SEND_UNSEQUENCED => "SEND_UNSEQUENCED",
            COMMAND_BANDWIDTH_LIMIT => "BANDWIDTH_LIMIT",
            COMMAND_THROTTLE_CONFIGURE => "THROTTLE_CONFIGURE",
            COMMAND_SEND_UNRELIABLE_FRAGMENT => "SEND_UNRELIABLE_FRAGMENT",
            _ => "UNKNOWN",
        }
    }
}

fn decode_fragment(buf: &mut Bytes) -> FragmentCommand {
    FragmentCommand {
        start_sequence_number: buf.get_u16(),
        data_length: buf.get_u16(),
        fragment_count: buf.get_u32(),
        fragment_number: buf.get_u32(),
        total_length: buf.get_u32(),
        fragment_offset: buf.get_u32(),
    }
}

/// Point past which a wrapped timestamp is treated as "in the past".
pub const TIME_OVERFLOW: Timestamp = 86_400_000;

/// Wrapping comparison: is `a` earlier than `b`?
pub fn time_less(a: Timestamp, b: Timestamp) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

/// Wrapping comparison: is `a` at or after `b`?
pub fn time_greater_equal(a: Timestamp, b: Timestamp) -> bool {
    !time_less(a, b)
}

/// Absolute difference between two wrapped timestamps.
pub fn time_difference(a: Timestamp, b: Timestamp) -> Timestamp {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_sizes_match_command_size_table() {
        let commands = [
            Command::new(
                COMMAND_ACKNOWLEDGE,
                0,
                CommandBody::Acknowledge {
                    received_reliable_sequence_number: 7,
                    received_sent_time: 99,
                },
            ),
            Command::new(COMMAND_PING | COMMAND_FLAG_ACKNOWLEDGE, 0xFF, CommandBody::Ping),
            Command::new(COMMAND_DISCONNECT, 0xFF, CommandBody::Disconnect { data: 1 }),
            Command::new(
                COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
                2,
                CommandBody::SendReliable { data_length: 10 },
            ),
            Command::new(
                COMMAND_SEND_FRAGMENT | COMMAND_FLAG_ACKNOWLEDGE,
                0,
                CommandBody::SendFragment(FragmentCommand {
                    start_sequence_number: 1,
                    data_length: 100,
                    fragment_count: 4,
                    fragment_number: 2,
                    total_length: 400,
                    fragment_offset: 200,
                }),
            ),
            Command::new(
                COMMAND_BANDWIDTH_LIMIT | COMMAND_FLAG_ACKNOWLEDGE,
                0xFF,
                CommandBody::BandwidthLimit {
                    incoming_bandwidth: 0,
                    outgoing_bandwidth: 57600,
                },
            ),
        ];

        for command in commands {
            let mut buf = BytesMut::new();
            command.encode(&mut buf);
            assert_eq!(buf.len(), command.size(), "size mismatch for {}", command.name());

            let mut bytes = buf.freeze();
            let decoded = Command::decode(&mut bytes).expect("decode");
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn header_packs_session_and_flags() {
        let header = ProtocolHeader {
            peer_id: 0x00AB | (2 << HEADER_SESSION_SHIFT) | HEADER_FLAG_SENT_TIME,
            sent_time: Some(0x1234),
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), 4);

        let mut bytes = buf.freeze();
        let decoded = ProtocolHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded.target_peer_id(), 0x00AB);
        assert_eq!(decoded.session_id(), 2);
        assert_eq!(decoded.sent_time, Some(0x1234));

        let bare = ProtocolHeader {
            peer_id: constants::PROTOCOL_MAXIMUM_PEER_ID,
            sent_time: None,
        };
        let mut buf = BytesMut::new();
        bare.encode(&mut buf);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn time_comparison_wraps() {
        assert!(time_less(10, 20));
        assert!(!time_less(20, 10));
        assert!(time_less(u32::MAX - 5, 5));
        assert_eq!(time_difference(u32::MAX - 5, 5), 11);
        assert_eq!(time_difference(5, u32::MAX - 5), 11);
    }
}
