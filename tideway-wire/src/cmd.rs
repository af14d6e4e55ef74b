use crate::hmac::{ChainedHmac, MAC_LEN};
use crate::ioq::ByteQueue;
use crate::netio::{
    extract_id, extract_len_prefixed, extract_u8, extract_uleb128, extract_utf8_prefixed,
    require_end, write_len_prefixed, write_uleb128, BadDecode, DecodeResult,
};
use tideway_base::{Id, ObjectType, RefineKind, Role};

/// The running protocol revision; a frame with any other version byte
/// is rejected outright.
pub const PROTOCOL_VERSION: u8 = 6;

/// Ceiling on a single frame's payload, so one oversized frame cannot
/// exhaust memory before the MAC is ever checked.
pub const MAX_PAYLOAD_LEN: usize = 1 << 27;

// Handshake-time fields (names, patterns, key material, error text)
// are all short; bound them well below the frame ceiling.
const MAX_FIELD_LEN: usize = 1 << 14;

/// One protocol command. The payload encodings are fixed byte layouts,
/// not a general serialization format; coding density matters here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Netcmd {
    Error {
        msg: String,
    },
    Bye,
    Hello {
        key_name: String,
        key: Vec<u8>,
        nonce: Id,
    },
    Anonymous {
        role: Role,
        include: String,
        exclude: String,
        key_blob: Vec<u8>,
    },
    Auth {
        role: Role,
        include: String,
        exclude: String,
        client: Id,
        nonce_echo: Id,
        key_blob: Vec<u8>,
        signature: Vec<u8>,
    },
    Confirm,
    Refine {
        kind: RefineKind,
        /// A serialized merkle node, opaque at this layer; the trie
        /// code checks its self-hash and shape.
        node: Vec<u8>,
    },
    Done {
        /// Vestigial: written as zero and ignored on receipt.
        level: u64,
        ty: ObjectType,
        n_items: u64,
    },
    SendData {
        ty: ObjectType,
        item: Id,
    },
    SendDelta {
        ty: ObjectType,
        base: Id,
        target: Id,
    },
    Data {
        ty: ObjectType,
        item: Id,
        payload: Vec<u8>,
    },
    Delta {
        ty: ObjectType,
        base: Id,
        target: Id,
        delta: Vec<u8>,
    },
    Nonexistent {
        ty: ObjectType,
        item: Id,
    },
    Usher {
        greeting: String,
    },
    UsherReply {
        server: String,
        pattern: String,
    },
}

impl Netcmd {
    pub fn code(&self) -> u8 {
        match self {
            Netcmd::Error { .. } => 0,
            Netcmd::Bye => 1,
            Netcmd::Hello { .. } => 2,
            Netcmd::Anonymous { .. } => 3,
            Netcmd::Auth { .. } => 4,
            Netcmd::Confirm => 5,
            Netcmd::Refine { .. } => 6,
            Netcmd::Done { .. } => 7,
            Netcmd::SendData { .. } => 8,
            Netcmd::SendDelta { .. } => 9,
            Netcmd::Data { .. } => 10,
            Netcmd::Delta { .. } => 11,
            Netcmd::Nonexistent { .. } => 12,
            Netcmd::Usher { .. } => 100,
            Netcmd::UsherReply { .. } => 101,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Netcmd::Error { .. } => "error",
            Netcmd::Bye => "bye",
            Netcmd::Hello { .. } => "hello",
            Netcmd::Anonymous { .. } => "anonymous",
            Netcmd::Auth { .. } => "auth",
            Netcmd::Confirm => "confirm",
            Netcmd::Refine { .. } => "refine",
            Netcmd::Done { .. } => "done",
            Netcmd::SendData { .. } => "send_data",
            Netcmd::SendDelta { .. } => "send_delta",
            Netcmd::Data { .. } => "data",
            Netcmd::Delta { .. } => "delta",
            Netcmd::Nonexistent { .. } => "nonexistent",
            Netcmd::Usher { .. } => "usher",
            Netcmd::UsherReply { .. } => "usher_reply",
        }
    }

    /// Frame this command onto `out`, advancing the write-side MAC
    /// chain.
    pub fn write(&self, out: &mut Vec<u8>, hmac: &mut ChainedHmac) {
        let mut payload = Vec::new();
        self.write_payload(&mut payload);
        out.push(PROTOCOL_VERSION);
        out.push(self.code());
        write_uleb128(out, payload.len() as u64);
        out.extend_from_slice(&payload);
        let mac = hmac.process(&payload);
        out.extend_from_slice(&mac);
    }

    /// If `inbuf` holds a complete frame, consume it, verify its MAC
    /// against the read-side chain, and decode it. An incomplete frame
    /// leaves the buffer and the chain untouched. Any structural or
    /// MAC failure is final; the stream cannot be re-synchronized.
    pub fn read(inbuf: &mut ByteQueue, hmac: &mut ChainedHmac) -> DecodeResult<Option<Netcmd>> {
        let buf = inbuf.as_slice();
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(BadDecode(format!(
                "protocol version {} is not supported (want {})",
                buf[0], PROTOCOL_VERSION
            )));
        }
        if buf.len() < 2 {
            return Ok(None);
        }
        let code = buf[1];
        if !known_code(code) {
            return Err(BadDecode(format!("unknown command code {}", code)));
        }
        let mut pos = 2;
        let payload_len = match try_parse_uleb128(buf, &mut pos)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if payload_len > MAX_PAYLOAD_LEN as u64 {
            return Err(BadDecode(format!(
                "frame payload of {} bytes exceeds limit {}",
                payload_len, MAX_PAYLOAD_LEN
            )));
        }
        let payload_len = payload_len as usize;
        let total = pos + payload_len + MAC_LEN;
        if buf.len() < total {
            return Ok(None);
        }
        let payload = &buf[pos..pos + payload_len];
        let wire_mac = &buf[pos + payload_len..total];
        let computed = hmac.process(payload);
        if wire_mac != computed {
            return Err(BadDecode(format!(
                "mac check failed: got {}, wanted {}",
                hex::encode(wire_mac),
                hex::encode(computed)
            )));
        }
        let cmd = Netcmd::read_payload(code, payload)?;
        inbuf.pop_front(total);
        Ok(Some(cmd))
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            Netcmd::Error { msg } => {
                write_len_prefixed(out, msg.as_bytes());
            }
            Netcmd::Bye | Netcmd::Confirm => {}
            Netcmd::Hello {
                key_name,
                key,
                nonce,
            } => {
                write_len_prefixed(out, key_name.as_bytes());
                write_len_prefixed(out, key);
                out.extend_from_slice(nonce.as_bytes());
            }
            Netcmd::Anonymous {
                role,
                include,
                exclude,
                key_blob,
            } => {
                out.push(role.code());
                write_len_prefixed(out, include.as_bytes());
                write_len_prefixed(out, exclude.as_bytes());
                write_len_prefixed(out, key_blob);
            }
            Netcmd::Auth {
                role,
                include,
                exclude,
                client,
                nonce_echo,
                key_blob,
                signature,
            } => {
                out.push(role.code());
                write_len_prefixed(out, include.as_bytes());
                write_len_prefixed(out, exclude.as_bytes());
                out.extend_from_slice(client.as_bytes());
                out.extend_from_slice(nonce_echo.as_bytes());
                write_len_prefixed(out, key_blob);
                write_len_prefixed(out, signature);
            }
            Netcmd::Refine { kind, node } => {
                out.push(kind.code());
                out.extend_from_slice(node);
            }
            Netcmd::Done { level, ty, n_items } => {
                write_uleb128(out, *level);
                out.push(ty.code());
                write_uleb128(out, *n_items);
            }
            Netcmd::SendData { ty, item } | Netcmd::Nonexistent { ty, item } => {
                out.push(ty.code());
                out.extend_from_slice(item.as_bytes());
            }
            Netcmd::SendDelta { ty, base, target } => {
                out.push(ty.code());
                out.extend_from_slice(base.as_bytes());
                out.extend_from_slice(target.as_bytes());
            }
            Netcmd::Data { ty, item, payload } => {
                out.push(ty.code());
                out.extend_from_slice(item.as_bytes());
                write_len_prefixed(out, payload);
            }
            Netcmd::Delta {
                ty,
                base,
                target,
                delta,
            } => {
                out.push(ty.code());
                out.extend_from_slice(base.as_bytes());
                out.extend_from_slice(target.as_bytes());
                write_len_prefixed(out, delta);
            }
            Netcmd::Usher { greeting } => {
                write_len_prefixed(out, greeting.as_bytes());
            }
            Netcmd::UsherReply { server, pattern } => {
                write_len_prefixed(out, server.as_bytes());
                write_len_prefixed(out, pattern.as_bytes());
            }
        }
    }

    fn read_payload(code: u8, buf: &[u8]) -> DecodeResult<Netcmd> {
        let mut pos = 0;
        let pos = &mut pos;
        let cmd = match code {
            0 => Netcmd::Error {
                msg: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "error message")?,
            },
            1 => Netcmd::Bye,
            2 => Netcmd::Hello {
                key_name: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "server key name")?,
                key: extract_len_prefixed(buf, pos, MAX_FIELD_LEN, "server key")?,
                nonce: extract_id(buf, pos, "hello nonce")?,
            },
            3 => Netcmd::Anonymous {
                role: extract_role(buf, pos)?,
                include: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "include pattern")?,
                exclude: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "exclude pattern")?,
                key_blob: extract_len_prefixed(buf, pos, MAX_FIELD_LEN, "session key blob")?,
            },
            4 => Netcmd::Auth {
                role: extract_role(buf, pos)?,
                include: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "include pattern")?,
                exclude: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "exclude pattern")?,
                client: extract_id(buf, pos, "client key hash")?,
                nonce_echo: extract_id(buf, pos, "nonce echo")?,
                key_blob: extract_len_prefixed(buf, pos, MAX_FIELD_LEN, "session key blob")?,
                signature: extract_len_prefixed(buf, pos, MAX_FIELD_LEN, "signature")?,
            },
            5 => Netcmd::Confirm,
            6 => {
                let kind = extract_u8(buf, pos, "refine kind")?;
                let kind = RefineKind::from_code(kind)
                    .ok_or_else(|| BadDecode(format!("unknown refine kind {}", kind)))?;
                let node = buf[*pos..].to_vec();
                *pos = buf.len();
                Netcmd::Refine { kind, node }
            }
            7 => Netcmd::Done {
                level: extract_uleb128(buf, pos, "done level")?,
                ty: extract_object_type(buf, pos)?,
                n_items: extract_uleb128(buf, pos, "done item count")?,
            },
            8 => Netcmd::SendData {
                ty: extract_object_type(buf, pos)?,
                item: extract_id(buf, pos, "requested item")?,
            },
            9 => Netcmd::SendDelta {
                ty: extract_object_type(buf, pos)?,
                base: extract_id(buf, pos, "delta base")?,
                target: extract_id(buf, pos, "delta target")?,
            },
            10 => Netcmd::Data {
                ty: extract_object_type(buf, pos)?,
                item: extract_id(buf, pos, "item")?,
                payload: extract_len_prefixed(buf, pos, MAX_PAYLOAD_LEN, "item data")?,
            },
            11 => Netcmd::Delta {
                ty: extract_object_type(buf, pos)?,
                base: extract_id(buf, pos, "delta base")?,
                target: extract_id(buf, pos, "delta target")?,
                delta: extract_len_prefixed(buf, pos, MAX_PAYLOAD_LEN, "delta data")?,
            },
            12 => Netcmd::Nonexistent {
                ty: extract_object_type(buf, pos)?,
                item: extract_id(buf, pos, "missing item")?,
            },
            100 => Netcmd::Usher {
                greeting: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "usher greeting")?,
            },
            101 => Netcmd::UsherReply {
                server: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "usher server")?,
                pattern: extract_utf8_prefixed(buf, pos, MAX_FIELD_LEN, "usher pattern")?,
            },
            _ => unreachable!("caller filters unknown codes"),
        };
        require_end(buf, *pos, cmd.name())?;
        Ok(cmd)
    }
}

fn known_code(code: u8) -> bool {
    matches!(code, 0..=12 | 100 | 101)
}

fn extract_role(buf: &[u8], pos: &mut usize) -> DecodeResult<Role> {
    let code = extract_u8(buf, pos, "role")?;
    Role::from_code(code).ok_or_else(|| BadDecode(format!("unknown role code {}", code)))
}

fn extract_object_type(buf: &[u8], pos: &mut usize) -> DecodeResult<ObjectType> {
    let code = extract_u8(buf, pos, "object type")?;
    ObjectType::from_code(code).ok_or_else(|| BadDecode(format!("unknown object type {}", code)))
}

/// Parse a uleb128 from the head of a possibly-incomplete buffer:
/// `Ok(None)` means more bytes may complete it, `Err` means no amount
/// of further input can.
fn try_parse_uleb128(buf: &[u8], pos: &mut usize) -> DecodeResult<Option<u64>> {
    let mut val: u64 = 0;
    let mut shift = 0u32;
    loop {
        if *pos >= buf.len() {
            return Ok(None);
        }
        let byte = buf[*pos];
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(BadDecode("frame length uleb128 overflows".into()));
        }
        val |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(val));
        }
        shift += 7;
        if shift > 63 {
            return Err(BadDecode("frame length uleb128 overflows".into()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn sample_cmds() -> Vec<Netcmd> {
        let id1 = Id::of(b"one");
        let id2 = Id::of(b"two");
        vec![
            Netcmd::Error {
                msg: "something broke".into(),
            },
            Netcmd::Bye,
            Netcmd::Hello {
                key_name: "server@example".into(),
                key: vec![1, 2, 3, 4],
                nonce: id1,
            },
            Netcmd::Anonymous {
                role: Role::Sink,
                include: "*".into(),
                exclude: "".into(),
                key_blob: vec![9; 48],
            },
            Netcmd::Auth {
                role: Role::SourceAndSink,
                include: "branch.*".into(),
                exclude: "branch.private".into(),
                client: id1,
                nonce_echo: id2,
                key_blob: vec![7; 48],
                signature: vec![5; 64],
            },
            Netcmd::Confirm,
            Netcmd::Refine {
                kind: RefineKind::Query,
                node: vec![0xab; 45],
            },
            Netcmd::Done {
                level: 0,
                ty: ObjectType::Epoch,
                n_items: 3,
            },
            Netcmd::SendData {
                ty: ObjectType::File,
                item: id1,
            },
            Netcmd::SendDelta {
                ty: ObjectType::File,
                base: id1,
                target: id2,
            },
            Netcmd::Data {
                ty: ObjectType::Revision,
                item: id2,
                payload: b"revision bytes".to_vec(),
            },
            Netcmd::Delta {
                ty: ObjectType::File,
                base: id1,
                target: id2,
                delta: b"delta bytes".to_vec(),
            },
            Netcmd::Nonexistent {
                ty: ObjectType::Cert,
                item: id1,
            },
            Netcmd::Usher {
                greeting: "!hi".into(),
            },
            Netcmd::UsherReply {
                server: "host:4691".into(),
                pattern: "*".into(),
            },
        ]
    }

    #[test]
    fn test_round_trip_every_command() {
        // Writing with a clone of the read chain must decode to the
        // same command, for every command, at every chain position.
        let mut write_hmac = ChainedHmac::new();
        let mut read_hmac = ChainedHmac::new();
        for cmd in sample_cmds() {
            let mut out = Vec::new();
            cmd.write(&mut out, &mut write_hmac);
            let mut q = ByteQueue::new();
            q.append(&out);
            let got = Netcmd::read(&mut q, &mut read_hmac).unwrap().unwrap();
            assert_eq!(got, cmd);
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_partial_frames_wait() {
        let mut write_hmac = ChainedHmac::new();
        let cmd = Netcmd::Data {
            ty: ObjectType::File,
            item: Id::of(b"f"),
            payload: vec![3; 500],
        };
        let mut out = Vec::new();
        cmd.write(&mut out, &mut write_hmac);

        let mut read_hmac = ChainedHmac::new();
        let mut q = ByteQueue::new();
        let (head, last) = out.split_at(out.len() - 1);
        for chunk in head.chunks(7) {
            q.append(chunk);
            assert_eq!(Netcmd::read(&mut q, &mut read_hmac).unwrap(), None);
        }
        q.append(last);
        assert_eq!(Netcmd::read(&mut q, &mut read_hmac).unwrap(), Some(cmd));
        assert!(q.is_empty());
    }

    #[test]
    fn test_tampered_byte_fails_mac() {
        let mut write_hmac = ChainedHmac::new();
        let cmd = Netcmd::Data {
            ty: ObjectType::File,
            item: Id::of(b"f"),
            payload: b"content".to_vec(),
        };
        let mut out = Vec::new();
        cmd.write(&mut out, &mut write_hmac);
        // Flip one payload bit.
        let n = out.len() - MAC_LEN - 1;
        out[n] ^= 0x01;

        let mut read_hmac = ChainedHmac::new();
        let mut q = ByteQueue::new();
        q.append(&out);
        let err = Netcmd::read(&mut q, &mut read_hmac).unwrap_err();
        assert!(err.0.contains("mac check failed"));
    }

    #[test]
    fn test_replayed_frame_fails_mac() {
        let mut write_hmac = ChainedHmac::new();
        let mut out = Vec::new();
        Netcmd::Bye.write(&mut out, &mut write_hmac);

        let mut read_hmac = ChainedHmac::new();
        let mut q = ByteQueue::new();
        q.append(&out);
        q.append(&out);
        assert!(Netcmd::read(&mut q, &mut read_hmac).unwrap().is_some());
        assert!(Netcmd::read(&mut q, &mut read_hmac).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut q = ByteQueue::new();
        q.append(&[PROTOCOL_VERSION + 1]);
        let mut h = ChainedHmac::new();
        assert!(Netcmd::read(&mut q, &mut h).is_err());
    }

    #[test]
    fn test_unknown_code_rejected() {
        let mut q = ByteQueue::new();
        q.append(&[PROTOCOL_VERSION, 55]);
        let mut h = ChainedHmac::new();
        assert!(Netcmd::read(&mut q, &mut h).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut q = ByteQueue::new();
        q.append(&[PROTOCOL_VERSION, 1]);
        let mut len = Vec::new();
        write_uleb128(&mut len, (MAX_PAYLOAD_LEN as u64) + 1);
        q.append(&len);
        let mut h = ChainedHmac::new();
        let err = Netcmd::read(&mut q, &mut h).unwrap_err();
        assert!(err.0.contains("exceeds limit"));
    }

    #[test]
    fn test_trailing_garbage_in_payload_rejected() {
        // A confirm frame whose payload is not empty fails structurally
        // even when the MAC is right.
        let mut payload_q = ByteQueue::new();
        let mut h = ChainedHmac::new();
        let mac = h.process(b"x");
        payload_q.append(&[PROTOCOL_VERSION, 5, 1, b'x']);
        payload_q.append(&mac);
        let mut read_h = ChainedHmac::new();
        assert!(Netcmd::read(&mut payload_q, &mut read_h).is_err());
    }
}
