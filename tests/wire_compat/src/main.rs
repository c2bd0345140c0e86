fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use peerdrop_data_channel::codec::{self, ChannelMode, Frame};
    use peerdrop_data_channel::manual::SdpKind;
    use peerdrop_data_channel::SessionDescription;
    use peerdrop_protocol::{ChunkHeader, Message, RejectReason};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Message envelope ---

    #[test]
    fn fixture_meta() {
        let Message::Meta(meta) = roundtrip_test::<Message>("meta.json") else {
            panic!("meta.json is not a meta message");
        };
        assert_eq!(meta.total_chunks, 3);
        assert!(meta.hash.is_some());
    }

    #[test]
    fn fixture_meta_without_hash() {
        // `hash` stays absent rather than serializing as null.
        let Message::Meta(meta) = roundtrip_test::<Message>("meta_without_hash.json") else {
            panic!("not a meta message");
        };
        assert!(meta.hash.is_none());
    }

    #[test]
    fn fixture_chunk() {
        let Message::Chunk(chunk) = roundtrip_test::<Message>("chunk.json") else {
            panic!("chunk.json is not a chunk message");
        };
        assert_eq!(chunk.index, 2);
        assert_eq!(chunk.data, b"hello chunk");
    }

    #[test]
    fn chunk_accepts_plain_base64() {
        let mut fixture = load_fixture("chunk.json");
        fixture["data"] = serde_json::json!("aGVsbG8gY2h1bms=");
        let Message::Chunk(chunk) = serde_json::from_value(fixture).unwrap() else {
            panic!("not a chunk message");
        };
        assert_eq!(chunk.data, b"hello chunk");
    }

    #[test]
    fn fixture_transfer_accepted() {
        let Message::TransferAccepted(a) = roundtrip_test::<Message>("transfer_accepted.json")
        else {
            panic!("not an acceptance");
        };
        assert_eq!(a.resume_index, 1);
    }

    #[test]
    fn fixture_transfer_rejected() {
        let Message::TransferRejected(r) = roundtrip_test::<Message>("transfer_rejected.json")
        else {
            panic!("not a rejection");
        };
        assert_eq!(r.reason, RejectReason::QuotaExceeded);
    }

    #[test]
    fn fixture_ping() {
        assert_eq!(roundtrip_test::<Message>("ping.json"), Message::Ping);
    }

    #[test]
    fn fixture_chat() {
        let Message::Chat(chat) = roundtrip_test::<Message>("chat.json") else {
            panic!("not a chat message");
        };
        assert_eq!(chat.timestamp, 1_700_000_000_123);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg: Message = serde_json::from_str(r#"{"type":"file-preview","x":1}"#).unwrap();
        assert_eq!(msg, Message::Unknown);
    }

    #[test]
    fn unknown_reject_reason_reads_as_declined() {
        let mut fixture = load_fixture("transfer_rejected.json");
        fixture["reason"] = serde_json::json!("user-cancelled");
        let Message::TransferRejected(r) = serde_json::from_value(fixture).unwrap() else {
            panic!("not a rejection");
        };
        assert_eq!(r.reason, RejectReason::Declined);
    }

    // --- Binary chunk frame ---

    #[test]
    fn fixture_chunk_header() {
        let header = roundtrip_test::<ChunkHeader>("chunk_header.json");
        assert_eq!(header.msg_type, ChunkHeader::TYPE);

        let frame = codec::encode_binary_chunk(&header, &[1, 2, 3]).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let on_wire: serde_json::Value = serde_json::from_slice(&frame[4..4 + len]).unwrap();
        assert_eq!(on_wire, load_fixture("chunk_header.json"));
        assert_eq!(&frame[4 + len..], &[1, 2, 3]);
    }

    #[test]
    fn chunk_framing_differs_by_mode() {
        let msg: Message = serde_json::from_value(load_fixture("chunk.json")).unwrap();

        let Frame::Binary(binary) = codec::encode(ChannelMode::Broker, &msg).unwrap() else {
            panic!("broker mode must frame chunks as binary");
        };
        assert_eq!(
            codec::decode(ChannelMode::Broker, Frame::Binary(binary)).unwrap(),
            msg
        );

        let Frame::Text(text) = codec::encode(ChannelMode::Manual, &msg).unwrap() else {
            panic!("manual mode must frame chunks as text");
        };
        let on_wire: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(on_wire, load_fixture("chunk.json"));
    }

    // --- Manual signaling ---

    #[test]
    fn fixture_session_description() {
        let desc = roundtrip_test::<SessionDescription>("session_description.json");
        assert_eq!(desc.kind, SdpKind::Offer);

        let text = read_fixture("session_description.json");
        assert!(SessionDescription::from_signal(&text, SdpKind::Offer).is_ok());
        assert!(SessionDescription::from_signal(&text, SdpKind::Answer).is_err());
    }

    // --- Transfer id derivation ---

    #[test]
    fn fixture_transfer_id() {
        let fixture = load_fixture("transfer_id.json");
        let name = fixture["name"].as_str().unwrap();
        let size = fixture["size"].as_u64().unwrap();
        let modified = fixture["modified"].as_i64().unwrap();
        let expected = fixture["transferId"].as_str().unwrap();

        let got = peerdrop_transfer::transfer_id(name, size, modified);
        assert_eq!(got, expected, "transfer id mismatch for {name}");

        let meta = load_fixture("meta.json");
        assert_eq!(meta["transferId"], expected);
    }
}
