//! Envelope classification and construction.
//!
//! An inbound frame is one serialized `FromRadio` envelope. Only the routed
//! mesh-packet kind carrying a cleartext text-message payload is interpreted
//! here; everything else passes through opaquely for the foreground to
//! finish interpreting.

use meshtastic::{Message, protobufs};
use tracing::trace;

/// Destination address meaning "every node on the channel".
pub const BROADCAST_ADDR: u32 = 0xffffffff;

const TEXT_HOP_LIMIT: u32 = 7;

/// A routed text message extracted from an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundText {
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub packet_id: u32,
    pub rx_time: u32,
    pub payload: Vec<u8>,
}

impl InboundText {
    /// Whether this message targets a channel rather than a single node.
    pub fn is_channel_message(&self) -> bool {
        self.to == BROADCAST_ADDR
    }
}

/// What the pipeline should do with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// A cleartext text message; process headlessly.
    Text(InboundText),
    /// Valid envelope the headless path cannot resolve (non-packet kinds,
    /// encrypted payloads, non-text ports). Buffer verbatim for the
    /// foreground handoff.
    Passthrough,
    /// Not a parseable envelope; drop and log, never buffer.
    Malformed,
}

/// Classify one inbound envelope.
pub fn classify(frame: &[u8]) -> Classification {
    let from_radio = match protobufs::FromRadio::decode(frame) {
        Ok(envelope) => envelope,
        Err(_) => return Classification::Malformed,
    };

    let mesh_packet = match from_radio.payload_variant {
        Some(protobufs::from_radio::PayloadVariant::Packet(packet)) => packet,
        _ => return Classification::Passthrough,
    };

    let data = match mesh_packet.payload_variant {
        Some(protobufs::mesh_packet::PayloadVariant::Decoded(data)) => data,
        // Encrypted payloads cannot be read headlessly.
        _ => return Classification::Passthrough,
    };

    if data.portnum() != protobufs::PortNum::TextMessageApp {
        trace!(port = data.portnum, "non-text application payload");
        return Classification::Passthrough;
    }

    Classification::Text(InboundText {
        from: mesh_packet.from,
        to: mesh_packet.to,
        channel: mesh_packet.channel,
        packet_id: mesh_packet.id,
        rx_time: mesh_packet.rx_time,
        payload: data.payload,
    })
}

/// Decode text bytes, dropping characters that would corrupt storage or
/// notifications. Returns an empty string when nothing displayable remains.
pub fn sanitize_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Build a serialized `ToRadio` envelope carrying one outbound text message.
///
/// Returns the generated packet id alongside the wire bytes so callers can
/// correlate acknowledgements.
pub fn build_text_packet(destination: Option<u32>, channel: u32, text: &str) -> (u32, Vec<u8>) {
    let packet_id = rand::random::<u32>();

    let mesh_packet = protobufs::MeshPacket {
        payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
            protobufs::Data {
                portnum: protobufs::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            },
        )),
        from: 0,
        to: destination.unwrap_or(BROADCAST_ADDR),
        id: packet_id,
        channel,
        hop_limit: TEXT_HOP_LIMIT,
        hop_start: TEXT_HOP_LIMIT,
        want_ack: false,
        priority: protobufs::mesh_packet::Priority::Reliable as i32,
        ..Default::default()
    };

    let envelope = protobufs::ToRadio {
        payload_variant: Some(protobufs::to_radio::PayloadVariant::Packet(mesh_packet)),
        ..Default::default()
    };

    (packet_id, envelope.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn text_frame(from: u32, to: u32, channel: u32, id: u32, payload: &[u8]) -> Vec<u8> {
        let envelope = protobufs::FromRadio {
            payload_variant: Some(protobufs::from_radio::PayloadVariant::Packet(
                protobufs::MeshPacket {
                    payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
                        protobufs::Data {
                            portnum: protobufs::PortNum::TextMessageApp as i32,
                            payload: payload.to_vec(),
                            ..Default::default()
                        },
                    )),
                    from,
                    to,
                    id,
                    channel,
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        envelope.encode_to_vec()
    }

    #[test]
    fn test_classify_text_message() {
        let frame = text_frame(0x11111111, BROADCAST_ADDR, 2, 42, b"hello");
        match classify(&frame) {
            Classification::Text(text) => {
                assert_eq!(text.from, 0x11111111);
                assert_eq!(text.channel, 2);
                assert_eq!(text.packet_id, 42);
                assert_eq!(text.payload, b"hello");
                assert!(text.is_channel_message());
            }
            other => panic!("expected text classification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_direct_message() {
        let frame = text_frame(0x11111111, 0x22222222, 0, 7, b"hi");
        match classify(&frame) {
            Classification::Text(text) => assert!(!text.is_channel_message()),
            other => panic!("expected text classification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_non_packet_envelope() {
        let envelope = protobufs::FromRadio {
            payload_variant: Some(protobufs::from_radio::PayloadVariant::MyInfo(
                protobufs::MyNodeInfo::default(),
            )),
            ..Default::default()
        };
        assert_eq!(classify(&envelope.encode_to_vec()), Classification::Passthrough);
    }

    #[test]
    fn test_classify_encrypted_packet() {
        let envelope = protobufs::FromRadio {
            payload_variant: Some(protobufs::from_radio::PayloadVariant::Packet(
                protobufs::MeshPacket {
                    payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Encrypted(
                        vec![0xde, 0xad, 0xbe, 0xef],
                    )),
                    from: 1,
                    to: 2,
                    id: 3,
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        assert_eq!(classify(&envelope.encode_to_vec()), Classification::Passthrough);
    }

    #[test]
    fn test_classify_non_text_port() {
        let envelope = protobufs::FromRadio {
            payload_variant: Some(protobufs::from_radio::PayloadVariant::Packet(
                protobufs::MeshPacket {
                    payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
                        protobufs::Data {
                            portnum: protobufs::PortNum::PositionApp as i32,
                            payload: vec![1, 2, 3],
                            ..Default::default()
                        },
                    )),
                    from: 1,
                    to: 2,
                    id: 3,
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        assert_eq!(classify(&envelope.encode_to_vec()), Classification::Passthrough);
    }

    #[test]
    fn test_classify_malformed_bytes() {
        // 0xFF repeated is not a valid protobuf field stream.
        assert_eq!(classify(&[0xff, 0xff, 0xff, 0xff]), Classification::Malformed);
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize_text(b"hi\x00there\x07"), "hithere");
        assert_eq!(sanitize_text(b"line1\nline2"), "line1\nline2");
        assert_eq!(sanitize_text(b"  padded  "), "padded");
    }

    #[test]
    fn test_sanitize_empty_results() {
        assert_eq!(sanitize_text(b""), "");
        assert_eq!(sanitize_text(b"\x01\x02\x03"), "");
        assert_eq!(sanitize_text(b"   "), "");
    }

    #[test]
    fn test_build_text_packet_roundtrip() {
        let (packet_id, bytes) = build_text_packet(Some(0x22222222), 1, "ping");
        let envelope = protobufs::ToRadio::decode(bytes.as_slice()).unwrap();
        match envelope.payload_variant {
            Some(protobufs::to_radio::PayloadVariant::Packet(packet)) => {
                assert_eq!(packet.to, 0x22222222);
                assert_eq!(packet.id, packet_id);
                assert_eq!(packet.channel, 1);
                match packet.payload_variant {
                    Some(protobufs::mesh_packet::PayloadVariant::Decoded(data)) => {
                        assert_eq!(data.portnum(), protobufs::PortNum::TextMessageApp);
                        assert_eq!(data.payload, b"ping");
                    }
                    other => panic!("expected decoded payload, got {other:?}"),
                }
            }
            other => panic!("expected packet variant, got {other:?}"),
        }
    }

    #[test]
    fn test_build_text_packet_defaults_to_broadcast() {
        let (_, bytes) = build_text_packet(None, 0, "all");
        let envelope = protobufs::ToRadio::decode(bytes.as_slice()).unwrap();
        match envelope.payload_variant {
            Some(protobufs::to_radio::PayloadVariant::Packet(packet)) => {
                assert_eq!(packet.to, BROADCAST_ADDR);
            }
            other => panic!("expected packet variant, got {other:?}"),
        }
    }
}
