use serde::{Deserialize, Serialize};

/// A signaling record relayed through the rendezvous service.
///
/// `offer`, `answer`, and `ice-candidate` payloads are opaque to the
/// service: it forwards them verbatim between the two ends of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    CreateRoom,

    #[serde(rename_all = "camelCase")]
    RoomCreated { room_code: String },

    #[serde(rename_all = "camelCase")]
    JoinRoom { room_code: String },

    #[serde(rename_all = "camelCase")]
    RoomJoined { room_code: String },

    #[serde(rename_all = "camelCase")]
    ClientJoined { client_id: String },

    Offer { sdp: serde_json::Value },

    Answer { sdp: serde_json::Value },

    IceCandidate { candidate: serde_json::Value },

    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_room_wire_shape() {
        let json = serde_json::to_string(&Signal::CreateRoom).unwrap();
        assert_eq!(json, "{\"type\":\"create-room\"}");
    }

    #[test]
    fn room_created_uses_camel_case() {
        let json = serde_json::to_string(&Signal::RoomCreated {
            room_code: "4217".into(),
        })
        .unwrap();
        assert!(json.contains("\"roomCode\":\"4217\""));
    }

    #[test]
    fn descriptor_payloads_stay_opaque() {
        let sdp = serde_json::json!({"kind": "offer", "blob": "v=0..."});
        let signal = Signal::Offer { sdp: sdp.clone() };
        let json = serde_json::to_string(&signal).unwrap();
        let parsed: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Signal::Offer { sdp });
    }

    #[test]
    fn roundtrip_all_variants() {
        let signals = vec![
            Signal::CreateRoom,
            Signal::RoomCreated {
                room_code: "1000".into(),
            },
            Signal::JoinRoom {
                room_code: "9999".into(),
            },
            Signal::RoomJoined {
                room_code: "9999".into(),
            },
            Signal::ClientJoined {
                client_id: "c-1".into(),
            },
            Signal::Offer {
                sdp: serde_json::json!("opaque"),
            },
            Signal::Answer {
                sdp: serde_json::json!({"a": 1}),
            },
            Signal::IceCandidate {
                candidate: serde_json::json!({"candidate": "udp 1 ..."}),
            },
            Signal::Error {
                message: "invalid room".into(),
            },
        ];
        for signal in signals {
            let json = serde_json::to_string(&signal).unwrap();
            let parsed: Signal = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, signal);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result: Result<Signal, _> = serde_json::from_str("{\"type\":\"subscribe\"}");
        assert!(result.is_err());
    }
}
