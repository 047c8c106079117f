use crate::error::{StoreError, StoreResult};

pub const ENTRY_MAGIC_NUM: u32 = 0x_4C45_4447;
pub const BLANK_MAGIC_NUM: u32 = 0x_B1A7_B1A7;

// magic(4) + total_size(4) + index(8) + term(8) + checksum(4) + body_len(4)
pub const ENTRY_HEADER_SIZE: usize = 32;

/// Smallest filler record: magic(4) + remaining size(4).
pub const MIN_BLANK_LEN: usize = 8;

// entry_index(8) + entry_term(8) + data_offset(8) + entry_size(4) + flags(4)
pub const INDEX_UNIT_SIZE: usize = 32;

pub const INDEX_UNIT_VALID: u32 = 0x1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub body: Vec<u8>,
    /// Absolute offset of the record in the data segment list.
    pub pos: u64,
    /// Encoded record size, header included.
    pub size: u32,
}

impl LogEntry {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_index(index: u64, term: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            term,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.body.len()
    }

    /// Same logical entry, ignoring where each copy happens to be stored.
    pub fn same_payload(&self, other: &LogEntry) -> bool {
        self.index == other.index && self.term == other.term && self.body == other.body
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexUnit {
    pub entry_index: u64,
    pub entry_term: u64,
    pub data_offset: u64,
    pub entry_size: u32,
    pub flags: u32,
}

impl IndexUnit {
    pub fn for_entry(entry: &LogEntry) -> Self {
        Self {
            entry_index: entry.index,
            entry_term: entry.term,
            data_offset: entry.pos,
            entry_size: entry.size,
            flags: INDEX_UNIT_VALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags & INDEX_UNIT_VALID != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWidth {
    Fixed(usize),
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryPolicy {
    /// Pad the tail of a segment with a blank record; keep `min_blank_len` free for it.
    Blank { min_blank_len: usize },
    /// Records tile the segment exactly.
    Exact,
}

impl BoundaryPolicy {
    pub fn reserve(&self) -> usize {
        match self {
            BoundaryPolicy::Blank { min_blank_len } => *min_blank_len,
            BoundaryPolicy::Exact => 0,
        }
    }
}

/// What a recovery scan finds at a position inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Record { len: usize },
    Blank,
    End,
}

/// Record format plugged into a `SegmentList`.
pub trait RecordCodec: Send + Sync {
    type Record;

    fn width(&self) -> RecordWidth;

    fn boundary_policy(&self) -> BoundaryPolicy;

    fn encode(&self, record: &Self::Record) -> StoreResult<Vec<u8>>;

    /// `offset` is only used to report where a corrupted record sits.
    fn decode(&self, offset: u64, bytes: &[u8]) -> StoreResult<Self::Record>;

    fn classify(&self, head: &[u8]) -> RecordKind;

    /// Filler written over the `remaining` bytes of a segment before rolling.
    fn blank_marker(&self, remaining: usize) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy)]
pub struct DataCodec {
    min_blank_len: usize,
}

impl DataCodec {
    pub fn new(min_blank_len: usize) -> Self {
        Self { min_blank_len }
    }
}

impl Default for DataCodec {
    fn default() -> Self {
        Self::new(MIN_BLANK_LEN)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl RecordCodec for DataCodec {
    type Record = LogEntry;

    fn width(&self) -> RecordWidth {
        RecordWidth::Variable
    }

    fn boundary_policy(&self) -> BoundaryPolicy {
        BoundaryPolicy::Blank {
            min_blank_len: self.min_blank_len,
        }
    }

    fn encode(&self, entry: &LogEntry) -> StoreResult<Vec<u8>> {
        let total = entry.encoded_len();
        if total > u32::MAX as usize {
            return Err(StoreError::RecordTooLarge {
                size: total as u64,
                max: u32::MAX as u64,
            });
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&ENTRY_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(&entry.index.to_le_bytes());
        buf.extend_from_slice(&entry.term.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&entry.body).to_le_bytes());
        buf.extend_from_slice(&(entry.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&entry.body);
        Ok(buf)
    }

    fn decode(&self, offset: u64, data: &[u8]) -> StoreResult<LogEntry> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Err(StoreError::corrupt(
                offset,
                format!("{} bytes is shorter than an entry header", data.len()),
            ));
        }

        let magic = read_u32(data, 0);
        if magic != ENTRY_MAGIC_NUM {
            return Err(StoreError::corrupt(
                offset,
                format!("invalid magic number {:#x}", magic),
            ));
        }

        let total = read_u32(data, 4) as usize;
        let body_len = read_u32(data, 28) as usize;
        if total != data.len() || total != ENTRY_HEADER_SIZE + body_len {
            return Err(StoreError::corrupt(
                offset,
                format!(
                    "size mismatch: total {}, body {}, read {}",
                    total,
                    body_len,
                    data.len()
                ),
            ));
        }

        let body = &data[ENTRY_HEADER_SIZE..];
        let crc = read_u32(data, 24);
        let actual_crc = crc32fast::hash(body);
        if crc != actual_crc {
            return Err(StoreError::corrupt(
                offset,
                format!("crc mismatch: expected {}, got {}", crc, actual_crc),
            ));
        }

        Ok(LogEntry {
            index: read_u64(data, 8),
            term: read_u64(data, 16),
            body: body.to_vec(),
            pos: offset,
            size: total as u32,
        })
    }

    fn classify(&self, head: &[u8]) -> RecordKind {
        if head.len() < 4 {
            return RecordKind::End;
        }
        match read_u32(head, 0) {
            BLANK_MAGIC_NUM => RecordKind::Blank,
            ENTRY_MAGIC_NUM if head.len() >= ENTRY_HEADER_SIZE => {
                let total = read_u32(head, 4) as usize;
                if total < ENTRY_HEADER_SIZE || total > head.len() {
                    RecordKind::End
                } else {
                    RecordKind::Record { len: total }
                }
            }
            _ => RecordKind::End,
        }
    }

    fn blank_marker(&self, remaining: usize) -> Vec<u8> {
        if remaining < MIN_BLANK_LEN {
            return Vec::new();
        }
        let mut buf = Vec::with_capacity(MIN_BLANK_LEN);
        buf.extend_from_slice(&BLANK_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(remaining as u32).to_le_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexCodec {
    unit_size: usize,
}

impl IndexCodec {
    /// `unit_size` must be at least `INDEX_UNIT_SIZE`; extra bytes are zero padding.
    pub fn new(unit_size: usize) -> Self {
        Self { unit_size }
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }
}

impl Default for IndexCodec {
    fn default() -> Self {
        Self::new(INDEX_UNIT_SIZE)
    }
}

impl RecordCodec for IndexCodec {
    type Record = IndexUnit;

    fn width(&self) -> RecordWidth {
        RecordWidth::Fixed(self.unit_size)
    }

    fn boundary_policy(&self) -> BoundaryPolicy {
        BoundaryPolicy::Exact
    }

    fn encode(&self, unit: &IndexUnit) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.unit_size);
        buf.extend_from_slice(&unit.entry_index.to_le_bytes());
        buf.extend_from_slice(&unit.entry_term.to_le_bytes());
        buf.extend_from_slice(&unit.data_offset.to_le_bytes());
        buf.extend_from_slice(&unit.entry_size.to_le_bytes());
        buf.extend_from_slice(&unit.flags.to_le_bytes());
        buf.resize(self.unit_size, 0);
        Ok(buf)
    }

    fn decode(&self, offset: u64, data: &[u8]) -> StoreResult<IndexUnit> {
        if data.len() != self.unit_size {
            return Err(StoreError::corrupt(
                offset,
                format!("index unit of {} bytes, expected {}", data.len(), self.unit_size),
            ));
        }
        Ok(IndexUnit {
            entry_index: read_u64(data, 0),
            entry_term: read_u64(data, 8),
            data_offset: read_u64(data, 16),
            entry_size: read_u32(data, 24),
            flags: read_u32(data, 28),
        })
    }

    fn classify(&self, head: &[u8]) -> RecordKind {
        if head.len() < self.unit_size {
            return RecordKind::End;
        }
        if read_u32(head, 28) & INDEX_UNIT_VALID != 0 {
            RecordKind::Record {
                len: self.unit_size,
            }
        } else {
            RecordKind::End
        }
    }

    fn blank_marker(&self, _remaining: usize) -> Vec<u8> {
        Vec::new()
    }
}
