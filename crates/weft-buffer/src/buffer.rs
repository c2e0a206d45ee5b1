//! Growable read/write byte buffer.

use std::fmt::Debug;

/// Smallest backing allocation a growing buffer will use.
const MIN_CAPACITY: usize = 64;

/// Growable byte buffer with independent read and write cursors.
///
/// Bytes are appended at the write cursor and consumed from the read cursor.
/// [`ensure_writable`](Self::ensure_writable) makes room by compacting unread
/// bytes to offset 0 when that suffices, and otherwise grows the backing
/// storage by roughly 1.5x. Unread bytes are never dropped.
pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    locked: bool,
    total_appended: u64,
    total_consumed: u64,
}

impl ByteBuffer {
    /// Creates an empty buffer with no allocation.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty buffer with `capacity` writable bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
            locked: false,
            total_appended: 0,
            total_consumed: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Bytes written but not yet consumed.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Contiguous bytes available after the write cursor.
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// The unread bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Offset (relative to the read cursor) of the first `byte`, if any.
    pub fn position_of(&self, byte: u8) -> Option<usize> {
        self.readable().iter().position(|&b| b == byte)
    }

    /// Lifetime count of bytes committed into the buffer.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    /// Lifetime count of bytes consumed or cleared from the buffer.
    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Guarantees at least `n` contiguous writable bytes.
    pub fn ensure_writable(&mut self, n: usize) {
        self.assert_unlocked("ensure_writable");
        if self.writable_bytes() >= n {
            return;
        }

        let readable = self.readable_bytes();
        if self.data.len() - readable >= n {
            self.compact();
            return;
        }

        let needed = readable + n;
        let grown = self.data.len() + self.data.len() / 2;
        let new_capacity = needed.max(grown).max(MIN_CAPACITY);
        self.compact();
        self.data.resize(new_capacity, 0);
    }

    /// The writable region after the write cursor.
    ///
    /// Bytes written here become readable only after
    /// [`commit_write`](Self::commit_write).
    pub fn writable_mut(&mut self) -> &mut [u8] {
        self.assert_unlocked("writable_mut");
        &mut self.data[self.write_pos..]
    }

    /// Marks `n` bytes of the writable region as written.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`writable_bytes`](Self::writable_bytes).
    pub fn commit_write(&mut self, n: usize) {
        self.assert_unlocked("commit_write");
        assert!(
            n <= self.writable_bytes(),
            "commit_write({n}) exceeds writable bytes ({})",
            self.writable_bytes()
        );
        self.write_pos += n;
        self.total_appended += n as u64;
    }

    /// Copies `bytes` in at the write cursor, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let end = self.write_pos + bytes.len();
        self.data[self.write_pos..end].copy_from_slice(bytes);
        self.commit_write(bytes.len());
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Drops `n` bytes from the front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`readable_bytes`](Self::readable_bytes).
    pub fn consume_read(&mut self, n: usize) {
        self.assert_unlocked("consume_read");
        assert!(
            n <= self.readable_bytes(),
            "consume_read({n}) exceeds readable bytes ({})",
            self.readable_bytes()
        );
        self.read_pos += n;
        self.total_consumed += n as u64;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Removes and returns the first `n` readable bytes.
    pub fn split_to(&mut self, n: usize) -> Vec<u8> {
        assert!(
            n <= self.readable_bytes(),
            "split_to({n}) exceeds readable bytes ({})",
            self.readable_bytes()
        );
        let out = self.data[self.read_pos..self.read_pos + n].to_vec();
        self.consume_read(n);
        out
    }

    /// Drains every readable byte.
    pub fn consume_all(&mut self) -> Vec<u8> {
        self.split_to(self.readable_bytes())
    }

    /// Drains every readable byte as text, replacing invalid UTF-8.
    pub fn consume_all_as_string(&mut self) -> String {
        let bytes = self.consume_all();
        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }

    /// Discards all readable bytes and resets both cursors.
    pub fn clear(&mut self) {
        self.assert_unlocked("clear");
        self.total_consumed += self.readable_bytes() as u64;
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Moves unread bytes to offset 0.
    pub fn compact(&mut self) {
        self.assert_unlocked("compact");
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    // ------------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------------

    /// Forbids mutation until [`unlock`](Self::unlock).
    ///
    /// Used while a native I/O operation owns the buffer's memory.
    pub fn lock(&mut self) {
        assert!(!self.locked, "buffer is already locked");
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    fn assert_unlocked(&self, operation: &str) {
        assert!(
            !self.locked,
            "{operation} on a locked buffer (an I/O operation owns it)"
        );
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buffer = Self::with_capacity(bytes.len());
        buffer.append(bytes);
        buffer
    }
}

impl Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("capacity", &self.capacity())
            .field("locked", &self.locked)
            .finish()
    }
}
