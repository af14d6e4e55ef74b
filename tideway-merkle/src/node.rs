use sha1::{Digest, Sha1};
use tideway_base::{Id, ObjectType, SlotBitmap, ID_LEN};
use tideway_wire::{
    extract_bytes, extract_u8, extract_uleb128, require_end, write_uleb128, BadDecode,
    DecodeResult,
};

pub const FANOUT_BITS: usize = 4;
pub const NUM_SLOTS: usize = 1 << FANOUT_BITS;
pub const MAX_LEVELS: usize = (ID_LEN * 8) / FANOUT_BITS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    LiveLeaf,
    DeadLeaf,
    Subtree,
}

impl SlotState {
    fn code(self) -> u8 {
        match self {
            SlotState::Empty => 0,
            SlotState::LiveLeaf => 1,
            SlotState::DeadLeaf => 2,
            SlotState::Subtree => 3,
        }
    }

    fn from_code(code: u8) -> SlotState {
        match code {
            0 => SlotState::Empty,
            1 => SlotState::LiveLeaf,
            2 => SlotState::DeadLeaf,
            _ => SlotState::Subtree,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, SlotState::LiveLeaf | SlotState::DeadLeaf)
    }
}

/// The path to a trie node: 4 bits per level, packed low-nibble-first
/// into bytes, exactly as the corresponding bits appear in any id that
/// lives under the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prefix {
    nibbles: usize,
    bytes: Vec<u8>,
}

impl Prefix {
    pub fn root() -> Prefix {
        Prefix::default()
    }

    /// The first `level` nibbles of an id.
    pub fn of_id(id: &Id, level: usize) -> Prefix {
        debug_assert!(level <= MAX_LEVELS);
        let mut bytes = id.as_bytes()[..level / 2].to_vec();
        if level % 2 == 1 {
            bytes.push(id.as_bytes()[level / 2] & 0x0f);
        }
        Prefix {
            nibbles: level,
            bytes,
        }
    }

    /// This prefix extended by one slot digit.
    pub fn child(&self, slot: usize) -> Prefix {
        debug_assert!(slot < NUM_SLOTS);
        let mut bytes = self.bytes.clone();
        if self.nibbles % 2 == 0 {
            bytes.push(slot as u8);
        } else {
            *bytes.last_mut().expect("odd prefix has a final byte") |= (slot as u8) << 4;
        }
        Prefix {
            nibbles: self.nibbles + 1,
            bytes,
        }
    }

    pub fn level(&self) -> usize {
        self.nibbles
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn byte_len(level: usize) -> usize {
        (level * FANOUT_BITS + 7) / 8
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.bytes))
    }
}

/// One trie node. Its serialized form begins with the SHA-1 of the
/// remainder, and that leading hash is what a parent stores in the
/// corresponding subtree slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleNode {
    pub ty: ObjectType,
    pub level: usize,
    pub prefix: Prefix,
    pub total_leaves: u64,
    bitmap: SlotBitmap,
    slots: [Id; NUM_SLOTS],
}

impl MerkleNode {
    pub fn new(ty: ObjectType, level: usize, prefix: Prefix) -> MerkleNode {
        debug_assert_eq!(prefix.level(), level);
        MerkleNode {
            ty,
            level,
            prefix,
            total_leaves: 0,
            bitmap: SlotBitmap::new(),
            slots: [Id::ZERO; NUM_SLOTS],
        }
    }

    pub fn root(ty: ObjectType) -> MerkleNode {
        MerkleNode::new(ty, 0, Prefix::root())
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        SlotState::from_code(self.bitmap.get(slot))
    }

    pub fn slot_id(&self, slot: usize) -> Id {
        debug_assert!(self.slot_state(slot) != SlotState::Empty);
        self.slots[slot]
    }

    pub fn set_slot(&mut self, slot: usize, state: SlotState, val: Id) {
        self.bitmap.set(slot, state.code());
        self.slots[slot] = val;
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Serialize, prepending the self-hash.
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut rest = Vec::with_capacity(32 + NUM_SLOTS * ID_LEN);
        rest.push(self.ty.code());
        write_uleb128(&mut rest, self.level as u64);
        rest.extend_from_slice(self.prefix.as_bytes());
        write_uleb128(&mut rest, self.total_leaves);
        rest.extend_from_slice(&self.bitmap.to_bytes());
        for slot in 0..NUM_SLOTS {
            if self.slot_state(slot) != SlotState::Empty {
                rest.extend_from_slice(self.slots[slot].as_bytes());
            }
        }
        let hash: [u8; ID_LEN] = Sha1::digest(&rest).into();
        out.extend_from_slice(&hash);
        out.extend_from_slice(&rest);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    /// The node's code: the hash a parent's subtree slot carries.
    pub fn code(&self) -> Id {
        Id::from_slice(&self.encode()[..ID_LEN]).expect("leading self-hash")
    }

    pub fn read(buf: &[u8]) -> DecodeResult<MerkleNode> {
        let mut pos = 0;
        let pos = &mut pos;
        let claimed = extract_bytes(buf, pos, ID_LEN, "node hash")?.to_vec();

        let ty = extract_u8(buf, pos, "node type")?;
        let ty = ObjectType::from_code(ty)
            .ok_or_else(|| BadDecode(format!("unknown node type {}", ty)))?;

        let level = extract_uleb128(buf, pos, "node level")?;
        if level >= MAX_LEVELS as u64 {
            return Err(BadDecode(format!(
                "node level is {}, exceeds maximum {}",
                level, MAX_LEVELS
            )));
        }
        let level = level as usize;

        let pref_bytes = extract_bytes(buf, pos, Prefix::byte_len(level), "node prefix")?.to_vec();
        if level % 2 == 1 {
            let last = *pref_bytes.last().expect("odd level has prefix bytes");
            if last & 0xf0 != 0 {
                return Err(BadDecode("node prefix has stray trailing bits".into()));
            }
        }
        let prefix = Prefix {
            nibbles: level,
            bytes: pref_bytes,
        };

        let total_leaves = extract_uleb128(buf, pos, "number of leaves")?;

        let bm: [u8; SlotBitmap::BYTES] = extract_bytes(buf, pos, SlotBitmap::BYTES, "bitmap")?
            .try_into()
            .expect("fixed-width bitmap");
        let bitmap = SlotBitmap::from_bytes(bm);

        let mut slots = [Id::ZERO; NUM_SLOTS];
        for (slot, val) in slots.iter_mut().enumerate() {
            if SlotState::from_code(bitmap.get(slot)) != SlotState::Empty {
                let bytes = extract_bytes(buf, pos, ID_LEN, "slot value")?;
                *val = Id::from_slice(bytes).expect("fixed-width slot value");
            }
        }
        require_end(buf, *pos, "node")?;

        let checkhash: [u8; ID_LEN] = Sha1::digest(&buf[ID_LEN..]).into();
        if claimed != checkhash {
            return Err(BadDecode(format!(
                "mismatched node hash value {}, expected {}",
                hex::encode(&claimed),
                hex::encode(checkhash)
            )));
        }

        Ok(MerkleNode {
            ty,
            level,
            prefix,
            total_leaves,
            bitmap,
            slots,
        })
    }
}
