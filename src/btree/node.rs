// Slot-based node layout inside one page.
//
// Header (12 bytes):
//   flags:1  cell_count:2  free_start:2  free_end:2  fragmented:1  right_child:4
// The cell pointer array grows upward from offset 12 (2 bytes per cell);
// the cell arena grows downward from the page end. A cell is
// `varint key_len | key | varint value_len | value`; in interior nodes
// the value is a 4-byte little-endian child page number. Keys within a
// node are strictly ascending in lexicographic byte order.

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::varint::{get_varint, put_varint, varint_len};

/// Size of the node header.
pub const NODE_HEADER_SIZE: usize = 12;

/// Flag bit marking a leaf node.
pub const FLAG_LEAF: u8 = 0x01;

const OFF_FLAGS: usize = 0;
const OFF_CELL_COUNT: usize = 1;
const OFF_FREE_START: usize = 3;
const OFF_FREE_END: usize = 5;
const OFF_FRAGMENTED: usize = 7;
const OFF_RIGHT_CHILD: usize = 8;

/// Encoded size of a cell for the given key and value.
pub fn cell_size(key: &[u8], value: &[u8]) -> usize {
    varint_len(key.len() as u64) + key.len() + varint_len(value.len() as u64) + value.len()
}

/// Read-only view of a node within a page buffer.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    data: &'a [u8],
    page_no: PageId,
}

impl<'a> Node<'a> {
    /// Interprets `data` as a node, validating the header invariants.
    pub fn new(data: &'a [u8], page_no: PageId) -> Result<Self> {
        if data.len() < NODE_HEADER_SIZE {
            return Err(DbError::corrupt_page(page_no, "page smaller than node header"));
        }
        let node = Self { data, page_no };
        let free_start = node.free_start();
        let free_end = node.free_end();
        if free_start != NODE_HEADER_SIZE + node.cell_count() * 2 {
            return Err(DbError::corrupt_page(
                page_no,
                "free_start disagrees with cell count",
            ));
        }
        if free_end < free_start || free_end > data.len() {
            return Err(DbError::corrupt_page(page_no, "free region out of bounds"));
        }
        Ok(node)
    }

    pub fn page_no(&self) -> PageId {
        self.page_no
    }

    pub fn is_leaf(&self) -> bool {
        self.data[OFF_FLAGS] & FLAG_LEAF != 0
    }

    pub fn cell_count(&self) -> usize {
        u16::from_le_bytes([self.data[OFF_CELL_COUNT], self.data[OFF_CELL_COUNT + 1]]) as usize
    }

    pub fn free_start(&self) -> usize {
        u16::from_le_bytes([self.data[OFF_FREE_START], self.data[OFF_FREE_START + 1]]) as usize
    }

    pub fn free_end(&self) -> usize {
        u16::from_le_bytes([self.data[OFF_FREE_END], self.data[OFF_FREE_END + 1]]) as usize
    }

    pub fn fragmented(&self) -> u8 {
        self.data[OFF_FRAGMENTED]
    }

    pub fn right_child(&self) -> PageId {
        u32::from_le_bytes(
            self.data[OFF_RIGHT_CHILD..OFF_RIGHT_CHILD + 4]
                .try_into()
                .unwrap(),
        )
    }

    /// Free arena bytes available for a new cell plus its pointer.
    pub fn free_space(&self) -> usize {
        self.free_end() - self.free_start()
    }

    fn cell_offset(&self, i: usize) -> usize {
        let slot = NODE_HEADER_SIZE + i * 2;
        u16::from_le_bytes([self.data[slot], self.data[slot + 1]]) as usize
    }

    /// Key and value byte views of cell `i`.
    pub fn cell(&self, i: usize) -> Result<(&'a [u8], &'a [u8])> {
        if i >= self.cell_count() {
            return Err(DbError::corrupt_page(
                self.page_no,
                format!("cell index {i} out of range"),
            ));
        }
        let mut off = self.cell_offset(i);
        let corrupt = || DbError::corrupt_page(self.page_no, "cell overruns page");

        let (key_len, n) = get_varint(self.data.get(off..).ok_or_else(corrupt)?)?;
        off += n;
        let key_end = off + key_len as usize;
        let key = self.data.get(off..key_end).ok_or_else(corrupt)?;
        off = key_end;

        let (val_len, n) = get_varint(self.data.get(off..).ok_or_else(corrupt)?)?;
        off += n;
        let val_end = off + val_len as usize;
        let value = self.data.get(off..val_end).ok_or_else(corrupt)?;
        Ok((key, value))
    }

    /// Child page number stored in interior cell `i`.
    pub fn child(&self, i: usize) -> Result<PageId> {
        let (_, value) = self.cell(i)?;
        let bytes: [u8; 4] = value.try_into().map_err(|_| {
            DbError::corrupt_page(self.page_no, "interior cell value is not a child pointer")
        })?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Binary search by key: `(found, position)` where position is the
    /// match or the insertion point keeping keys ascending.
    pub fn search(&self, key: &[u8]) -> Result<(bool, usize)> {
        let mut lo = 0;
        let mut hi = self.cell_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (cell_key, _) = self.cell(mid)?;
            match cell_key.cmp(key) {
                std::cmp::Ordering::Equal => return Ok((true, mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok((false, lo))
    }
}

/// Mutable view of a node within a page buffer.
pub struct NodeMut<'a> {
    data: &'a mut [u8],
    page_no: PageId,
}

impl<'a> NodeMut<'a> {
    /// Formats `data` as an empty leaf.
    pub fn init_leaf(data: &mut [u8]) {
        Self::init(data, FLAG_LEAF);
    }

    /// Formats `data` as an empty interior node.
    pub fn init_interior(data: &mut [u8]) {
        Self::init(data, 0);
    }

    fn init(data: &mut [u8], flags: u8) {
        data[..NODE_HEADER_SIZE].fill(0);
        data[OFF_FLAGS] = flags;
        let free_start = NODE_HEADER_SIZE as u16;
        let free_end = data.len() as u16;
        data[OFF_FREE_START..OFF_FREE_START + 2].copy_from_slice(&free_start.to_le_bytes());
        data[OFF_FREE_END..OFF_FREE_END + 2].copy_from_slice(&free_end.to_le_bytes());
    }

    /// Interprets `data` as a node, validating the header.
    pub fn new(data: &'a mut [u8], page_no: PageId) -> Result<Self> {
        Node::new(data, page_no)?;
        Ok(Self { data, page_no })
    }

    /// Read-only view of the same bytes.
    pub fn as_node(&self) -> Node<'_> {
        Node {
            data: self.data,
            page_no: self.page_no,
        }
    }

    fn set_cell_count(&mut self, count: usize) {
        self.data[OFF_CELL_COUNT..OFF_CELL_COUNT + 2]
            .copy_from_slice(&(count as u16).to_le_bytes());
    }

    fn set_free_start(&mut self, off: usize) {
        self.data[OFF_FREE_START..OFF_FREE_START + 2]
            .copy_from_slice(&(off as u16).to_le_bytes());
    }

    fn set_free_end(&mut self, off: usize) {
        self.data[OFF_FREE_END..OFF_FREE_END + 2].copy_from_slice(&(off as u16).to_le_bytes());
    }

    pub fn set_right_child(&mut self, page_no: PageId) {
        self.data[OFF_RIGHT_CHILD..OFF_RIGHT_CHILD + 4]
            .copy_from_slice(&page_no.to_le_bytes());
    }

    /// Places a new cell at position `i`, shifting later pointers up.
    /// Fails with `NodeFull` when the free region cannot hold the cell
    /// and its pointer.
    pub fn insert_cell(&mut self, i: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let node = self.as_node();
        let count = node.cell_count();
        debug_assert!(i <= count);
        let size = cell_size(key, value);
        let free_start = node.free_start();
        let free_end = node.free_end();
        if free_end - free_start < size + 2 {
            return Err(DbError::NodeFull {
                needed: size + 2,
                available: free_end - free_start,
            });
        }

        // Cell content goes at the bottom of the arena.
        let cell_off = free_end - size;
        let mut off = cell_off;
        off += put_varint(&mut self.data[off..], key.len() as u64)?;
        self.data[off..off + key.len()].copy_from_slice(key);
        off += key.len();
        off += put_varint(&mut self.data[off..], value.len() as u64)?;
        self.data[off..off + value.len()].copy_from_slice(value);

        // Open slot `i` in the pointer array.
        let slot = NODE_HEADER_SIZE + i * 2;
        let array_end = NODE_HEADER_SIZE + count * 2;
        self.data.copy_within(slot..array_end, slot + 2);
        self.data[slot..slot + 2].copy_from_slice(&(cell_off as u16).to_le_bytes());

        self.set_cell_count(count + 1);
        self.set_free_start(free_start + 2);
        self.set_free_end(cell_off);
        Ok(())
    }

    /// Removes pointer `i`. The cell content stays behind as
    /// fragmentation; only the pointer array is compacted.
    pub fn delete_cell(&mut self, i: usize) -> Result<()> {
        let node = self.as_node();
        let count = node.cell_count();
        if i >= count {
            return Err(DbError::corrupt_page(
                self.page_no,
                format!("delete of cell {i} out of range"),
            ));
        }
        let (key, value) = node.cell(i)?;
        let lost = cell_size(key, value).min(u8::MAX as usize) as u8;

        let slot = NODE_HEADER_SIZE + i * 2;
        let array_end = NODE_HEADER_SIZE + count * 2;
        self.data.copy_within(slot + 2..array_end, slot);

        self.set_cell_count(count - 1);
        let free_start = self.as_node().free_start();
        self.set_free_start(free_start - 2);
        self.data[OFF_FRAGMENTED] = self.data[OFF_FRAGMENTED].saturating_add(lost);
        Ok(())
    }

    /// Overwrites cell `i`'s value in place. Only same-length values are
    /// allowed; the B-tree uses this to retarget child pointers.
    pub fn update_cell_value(&mut self, i: usize, new_value: &[u8]) -> Result<()> {
        let node = self.as_node();
        let (key, old_value) = node.cell(i)?;
        if old_value.len() != new_value.len() {
            return Err(DbError::invalid_format(format!(
                "in-place update must keep value length ({} != {})",
                old_value.len(),
                new_value.len()
            )));
        }
        let mut off = node.cell_offset(i);
        off += varint_len(key.len() as u64) + key.len();
        off += varint_len(old_value.len() as u64);
        self.data[off..off + new_value.len()].copy_from_slice(new_value);
        Ok(())
    }

    /// Rebuilds the node from owned cells, reclaiming all fragmentation.
    fn rebuild(&mut self, leaf: bool, cells: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        if leaf {
            Self::init_leaf(self.data);
        } else {
            Self::init_interior(self.data);
        }
        for (i, (key, value)) in cells.iter().enumerate() {
            self.insert_cell(i, key, value)?;
        }
        Ok(())
    }

    /// Splits this node in half into `right` (a fresh page buffer),
    /// returning the key to promote into the parent.
    ///
    /// Leaf: cells `[mid, count)` move right; the promoted key is a copy
    /// of the right half's first key. Interior: cells `[mid+1, count)`
    /// move right together with the old right_child; the median cell is
    /// promoted and its child pointer becomes the left half's new
    /// right_child. The left half is compacted while it is truncated.
    pub fn split_into(&mut self, right: &mut [u8], right_page_no: PageId) -> Result<Vec<u8>> {
        let node = self.as_node();
        let leaf = node.is_leaf();
        let count = node.cell_count();
        let mid = count / 2;
        debug_assert!(count >= 2, "splitting a node with {count} cells");

        let mut cells = Vec::with_capacity(count);
        for i in 0..count {
            let (key, value) = node.cell(i)?;
            cells.push((key.to_vec(), value.to_vec()));
        }
        let old_right_child = node.right_child();

        if leaf {
            NodeMut::init_leaf(right);
            let mut right = NodeMut::new(right, right_page_no)?;
            for (j, (key, value)) in cells[mid..].iter().enumerate() {
                right.insert_cell(j, key, value)?;
            }
            let promoted = cells[mid].0.clone();
            self.rebuild(true, &cells[..mid])?;
            Ok(promoted)
        } else {
            let (median_key, median_child) = cells[mid].clone();
            let median_child: [u8; 4] = median_child.as_slice().try_into().map_err(|_| {
                DbError::corrupt_page(self.page_no, "median cell value is not a child pointer")
            })?;

            NodeMut::init_interior(right);
            let mut right = NodeMut::new(right, right_page_no)?;
            for (j, (key, value)) in cells[mid + 1..].iter().enumerate() {
                right.insert_cell(j, key, value)?;
            }
            right.set_right_child(old_right_child);

            self.rebuild(false, &cells[..mid])?;
            self.set_right_child(u32::from_le_bytes(median_child));
            Ok(median_key)
        }
    }
}
