//! Block/symbol model: split a file into source and repair blocks, slice blocks into
//! symbols, and reassemble blocks and the file on the receiving side.
//!
//! Repair block `id >= S` carries exactly the bytes of source block `id mod S`. It is a
//! duplicated transmission opportunity, not an erasure code.

use std::collections::BTreeMap;
use std::ops::Range;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 1_600_000;
/// Default symbol size in bytes.
pub const DEFAULT_SYMBOL_SIZE: u32 = 16_000;
/// Default repair blocks per source block.
pub const DEFAULT_REPAIR_RATIO: f64 = 1.0;

/// Sender-side coding parameters. Receivers must use the same block and symbol sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodingParams {
    pub block_size: u32,
    pub symbol_size: u32,
    pub repair_ratio: f64,
}

impl Default for CodingParams {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            symbol_size: DEFAULT_SYMBOL_SIZE,
            repair_ratio: DEFAULT_REPAIR_RATIO,
        }
    }
}

/// Geometry shared by sender and receiver: where every block and symbol lives in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    file_length: u64,
    block_size: u64,
    symbol_size: u64,
    source_count: u32,
}

impl BlockLayout {
    pub fn new(file_length: u64, block_size: u32, symbol_size: u32) -> Result<Self, LayoutError> {
        if block_size == 0 {
            return Err(LayoutError::ZeroBlockSize);
        }
        if symbol_size == 0 {
            return Err(LayoutError::ZeroSymbolSize);
        }
        let block_size = u64::from(block_size);
        let count = file_length.div_ceil(block_size);
        let source_count = u32::try_from(count).map_err(|_| LayoutError::TooManyBlocks(count))?;
        Ok(Self {
            file_length,
            block_size,
            symbol_size: u64::from(symbol_size),
            source_count,
        })
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn symbol_size(&self) -> u64 {
        self.symbol_size
    }

    /// Number of source blocks, `S = ceil(file_length / block_size)`.
    pub fn source_count(&self) -> u32 {
        self.source_count
    }

    /// Source block a (source or repair) id stands for. `None` for an empty file.
    pub fn source_id(&self, block_id: u32) -> Option<u32> {
        (self.source_count > 0).then(|| block_id % self.source_count)
    }

    /// Byte range of a block within the file.
    pub fn block_range(&self, block_id: u32) -> Option<Range<u64>> {
        let source = self.source_id(block_id)?;
        let start = u64::from(source) * self.block_size;
        let end = (start + self.block_size).min(self.file_length);
        Some(start..end)
    }

    pub fn block_len(&self, block_id: u32) -> Option<u64> {
        self.block_range(block_id).map(|r| r.end - r.start)
    }

    /// Number of symbols in a block, `ceil(block_len / symbol_size)`.
    pub fn symbol_count(&self, block_id: u32) -> Option<u32> {
        self.block_len(block_id)
            .map(|len| len.div_ceil(self.symbol_size) as u32)
    }

    /// Length of symbol `symbol_id` of a block; only the last symbol may be short.
    pub fn symbol_len(&self, block_id: u32, symbol_id: u32) -> Option<u64> {
        let len = self.block_len(block_id)?;
        let start = u64::from(symbol_id) * self.symbol_size;
        (start < len).then(|| (len - start).min(self.symbol_size))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("symbol size must be non-zero")]
    ZeroSymbolSize,
    #[error("{0} blocks do not fit a 32-bit block id")]
    TooManyBlocks(u64),
}

/// Sender side: owns the file bytes and maps block ids to bytes and symbols.
pub struct Encoder {
    data: Vec<u8>,
    layout: BlockLayout,
    repair_count: u32,
}

impl Encoder {
    pub fn new(data: Vec<u8>, params: CodingParams) -> Result<Self, LayoutError> {
        let layout = BlockLayout::new(data.len() as u64, params.block_size, params.symbol_size)?;
        let repair_count = (f64::from(layout.source_count()) * params.repair_ratio.max(0.0))
            .floor()
            .min(f64::from(u32::MAX - layout.source_count())) as u32;
        Ok(Self {
            data,
            layout,
            repair_count,
        })
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn source_count(&self) -> u32 {
        self.layout.source_count()
    }

    /// `R = floor(S * repair_ratio)`.
    pub fn repair_count(&self) -> u32 {
        self.repair_count
    }

    /// Every transmissible block id, source ids first: `0..S+R`.
    pub fn block_ids(&self) -> Range<u32> {
        0..self.source_count() + self.repair_count
    }

    /// Bytes of source block `block_id mod S`. Empty for an empty file.
    pub fn block_bytes(&self, block_id: u32) -> &[u8] {
        match self.layout.block_range(block_id) {
            Some(r) => &self.data[r.start as usize..r.end as usize],
            None => &[],
        }
    }

    /// Consecutive `symbol_size` slices of a block; slice `k` is symbol `k`.
    pub fn symbols_of(&self, block_id: u32) -> impl Iterator<Item = &[u8]> {
        self.block_bytes(block_id)
            .chunks(self.layout.symbol_size() as usize)
    }

    pub fn symbol(&self, block_id: u32, symbol_id: u32) -> Option<&[u8]> {
        let block = self.block_bytes(block_id);
        let size = self.layout.symbol_size() as usize;
        let start = (symbol_id as usize).checked_mul(size)?;
        if start >= block.len() {
            return None;
        }
        Some(&block[start..(start + size).min(block.len())])
    }
}

/// Receiver side: accumulates symbols of one block until every symbol id is held.
#[derive(Debug, Clone)]
pub struct BlockAssembly {
    block_len: u64,
    symbol_size: u64,
    expected: u32,
    symbols: BTreeMap<u32, Vec<u8>>,
}

impl BlockAssembly {
    pub fn new(block_len: u64, symbol_size: u64) -> Self {
        Self {
            block_len,
            symbol_size,
            expected: block_len.div_ceil(symbol_size) as u32,
            symbols: BTreeMap::new(),
        }
    }

    /// Assembly sized for `block_id` under `layout`. `None` for an empty file.
    pub fn for_block(layout: &BlockLayout, block_id: u32) -> Option<Self> {
        layout
            .block_len(block_id)
            .map(|len| Self::new(len, layout.symbol_size()))
    }

    /// Record a symbol. Returns `true` if it was not already held; re-delivery is a no-op.
    pub fn add_symbol(&mut self, symbol_id: u32, data: Vec<u8>) -> Result<bool, AssemblyError> {
        if symbol_id >= self.expected {
            return Err(AssemblyError::SymbolOutOfRange {
                symbol_id,
                count: self.expected,
            });
        }
        let start = u64::from(symbol_id) * self.symbol_size;
        let want = (self.block_len - start).min(self.symbol_size);
        if data.len() as u64 != want {
            return Err(AssemblyError::SymbolLength {
                symbol_id,
                expected: want,
                actual: data.len() as u64,
            });
        }
        if self.symbols.contains_key(&symbol_id) {
            return Ok(false);
        }
        self.symbols.insert(symbol_id, data);
        Ok(true)
    }

    pub fn held(&self) -> u32 {
        self.symbols.len() as u32
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.held() == self.expected
    }

    /// Concatenate held symbols in symbol id order.
    pub fn decode(&self) -> Result<Vec<u8>, AssemblyError> {
        if !self.is_complete() {
            return Err(AssemblyError::IncompleteBlock {
                held: self.held(),
                expected: self.expected,
            });
        }
        let mut out = Vec::with_capacity(self.block_len as usize);
        for data in self.symbols.values() {
            out.extend_from_slice(data);
        }
        Ok(out)
    }
}

/// Receiver side: completed source blocks, keyed by source id.
#[derive(Debug, Clone)]
pub struct FileAssembly {
    source_count: u32,
    file_length: u64,
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl FileAssembly {
    pub fn new(layout: &BlockLayout) -> Self {
        Self {
            source_count: layout.source_count(),
            file_length: layout.file_length(),
            blocks: BTreeMap::new(),
        }
    }

    /// Store a block under its source id (`block_id mod S`). A source block already present
    /// is never overwritten. Returns `true` if the block was newly inserted.
    pub fn add_block(&mut self, block_id: u32, bytes: Vec<u8>) -> bool {
        if self.source_count == 0 {
            return false;
        }
        let source = block_id % self.source_count;
        if self.blocks.contains_key(&source) {
            return false;
        }
        self.blocks.insert(source, bytes);
        true
    }

    pub fn contains(&self, source_id: u32) -> bool {
        self.blocks.contains_key(&source_id)
    }

    pub fn missing(&self) -> u32 {
        self.source_count - self.blocks.len() as u32
    }

    /// True when every source id `0..S` is present. Vacuously true for an empty file.
    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    /// Concatenate blocks `0..S` in order.
    pub fn decode(&self) -> Result<Vec<u8>, AssemblyError> {
        if !self.is_complete() {
            return Err(AssemblyError::IncompleteFile {
                missing: self.missing(),
            });
        }
        let mut out = Vec::with_capacity(self.file_length as usize);
        for block in self.blocks.values() {
            out.extend_from_slice(block);
        }
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("symbol {symbol_id} out of range (block has {count} symbols)")]
    SymbolOutOfRange { symbol_id: u32, count: u32 },
    #[error("symbol {symbol_id} has {actual} bytes, expected {expected}")]
    SymbolLength {
        symbol_id: u32,
        expected: u64,
        actual: u64,
    },
    #[error("block incomplete: {held} of {expected} symbols")]
    IncompleteBlock { held: u32, expected: u32 },
    #[error("file incomplete: {missing} blocks missing")]
    IncompleteFile { missing: u32 },
}
