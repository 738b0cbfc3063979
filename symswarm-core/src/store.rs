//! Shared receive-side store. One per peer process; every session holds an `Arc` to it.
//!
//! Block assemblies sit in a sharded map so sessions delivering different blocks do not
//! contend. The file assembly sits behind one mutex held across insert, completeness check
//! and decode, so exactly one caller observes the file becoming complete.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::block::{AssemblyError, BlockAssembly, BlockLayout, FileAssembly};

/// Result of delivering one symbol to the store.
#[derive(Debug, PartialEq, Eq)]
pub enum SymbolOutcome {
    /// The source block this id maps to is already in the file.
    Redundant,
    /// Symbol id or length does not fit the block, or the file is empty.
    Rejected(AssemblyError),
    /// Symbol held; block still missing symbols.
    Pending,
    /// This symbol completed its block.
    BlockComplete(CompletedBlock),
}

#[derive(Debug, PartialEq, Eq)]
pub struct CompletedBlock {
    /// Id the block arrived under (source or repair).
    pub block_id: u32,
    /// `block_id mod S`.
    pub source_id: u32,
    pub bytes: Vec<u8>,
    /// False when another delivery of the same source block got there first.
    pub inserted: bool,
    /// Reassembled file. `Some` for exactly the one insertion that completed it.
    pub file: Option<Vec<u8>>,
}

pub struct AssemblyStore {
    layout: BlockLayout,
    blocks: DashMap<u32, BlockAssembly>,
    file: Mutex<FileAssembly>,
}

impl AssemblyStore {
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            file: Mutex::new(FileAssembly::new(&layout)),
            blocks: DashMap::new(),
            layout,
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn is_complete(&self) -> bool {
        self.file.lock().is_complete()
    }

    pub fn missing_blocks(&self) -> u32 {
        self.file.lock().missing()
    }

    /// Number of blocks with at least one symbol held and not yet complete.
    pub fn blocks_in_progress(&self) -> usize {
        self.blocks.len()
    }

    /// Reassembled file, if complete.
    pub fn decode_file(&self) -> Result<Vec<u8>, AssemblyError> {
        self.file.lock().decode()
    }

    /// Deliver one symbol; see [`SymbolOutcome`].
    pub fn add_symbol(&self, block_id: u32, symbol_id: u32, data: Vec<u8>) -> SymbolOutcome {
        let Some(source_id) = self.layout.source_id(block_id) else {
            return SymbolOutcome::Rejected(AssemblyError::SymbolOutOfRange {
                symbol_id,
                count: 0,
            });
        };
        if self.file.lock().contains(source_id) {
            return SymbolOutcome::Redundant;
        }

        let decoded = {
            let layout = self.layout;
            let mut asm = self.blocks.entry(block_id).or_insert_with(|| {
                BlockAssembly::new(layout.block_len(block_id).unwrap_or(0), layout.symbol_size())
            });
            // Re-checked under the shard lock: the source block may have been inserted,
            // and this id pruned, since the check above.
            if self.file.lock().contains(source_id) {
                drop(asm);
                self.blocks.remove(&block_id);
                return SymbolOutcome::Redundant;
            }
            if let Err(e) = asm.add_symbol(symbol_id, data) {
                return SymbolOutcome::Rejected(e);
            }
            if !asm.is_complete() {
                return SymbolOutcome::Pending;
            }
            match asm.decode() {
                Ok(bytes) => bytes,
                Err(e) => return SymbolOutcome::Rejected(e),
            }
        };
        self.blocks.remove(&block_id);

        let mut file = self.file.lock();
        let inserted = file.add_block(block_id, decoded.clone());
        let became_complete = inserted && file.is_complete();
        let file_bytes = if became_complete {
            file.decode().ok()
        } else {
            None
        };
        drop(file);
        if inserted {
            // Other assemblies for the same source (repair copies) are now moot.
            let s = self.layout.source_count();
            self.blocks.retain(|&id, _| id % s != source_id);
        }
        SymbolOutcome::BlockComplete(CompletedBlock {
            block_id,
            source_id,
            bytes: decoded,
            inserted,
            file: file_bytes,
        })
    }
}
