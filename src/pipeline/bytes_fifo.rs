// Fixed-capacity byte FIFO implemented as a circular buffer

/// A FIFO that can store a fixed number of bytes.
pub struct BytesFifo {
    buffer: Vec<u8>,
    size: usize,
    filled: usize,
    read_ptr: usize,
    write_ptr: usize,
}

impl BytesFifo {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            buffer: vec![0u8; size],
            size,
            filled: 0,
            read_ptr: 0,
            write_ptr: 0,
        }
    }

    /// Read at most `size` bytes from the FIFO.
    pub fn read(&mut self, size: usize) -> Vec<u8> {
        let size = size.min(self.filled);
        let mut out = Vec::with_capacity(size);

        let contiguous = (self.size - self.read_ptr).min(size);
        out.extend_from_slice(&self.buffer[self.read_ptr..self.read_ptr + contiguous]);
        self.read_ptr += contiguous;
        if contiguous < size {
            let leftover = size - contiguous;
            out.extend_from_slice(&self.buffer[..leftover]);
            self.read_ptr = leftover;
        }
        if self.read_ptr == self.size {
            self.read_ptr = 0;
        }

        self.filled -= size;
        out
    }

    /// Read all buffered bytes.
    pub fn read_all(&mut self) -> Vec<u8> {
        let filled = self.filled;
        self.read(filled)
    }

    /// Write as many bytes of `data` as fit. Returns the number written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let write_size = data.len().min(self.free());
        if write_size > 0 {
            let contiguous = (self.size - self.write_ptr).min(write_size);
            self.buffer[self.write_ptr..self.write_ptr + contiguous]
                .copy_from_slice(&data[..contiguous]);
            self.write_ptr += contiguous;

            if contiguous < write_size {
                let leftover = write_size - contiguous;
                self.buffer[..leftover].copy_from_slice(&data[contiguous..write_size]);
                self.write_ptr = leftover;
            }
            if self.write_ptr == self.size {
                self.write_ptr = 0;
            }
        }
        self.filled += write_size;
        write_size
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn free(&self) -> usize {
        self.size - self.filled
    }

    pub fn capacity(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mut fifo = BytesFifo::new(8);
        assert_eq!(fifo.write(b"abcdef"), 6);
        assert_eq!(fifo.len(), 6);
        assert_eq!(fifo.read(4), b"abcd");
        assert_eq!(fifo.read_all(), b"ef");
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_write_wraps_around() {
        let mut fifo = BytesFifo::new(8);
        fifo.write(b"abcdef");
        fifo.read(4);
        // 2 bytes buffered, 6 free; this write wraps
        assert_eq!(fifo.write(b"123456"), 6);
        assert_eq!(fifo.len(), 8);
        assert_eq!(fifo.read_all(), b"ef123456");
    }

    #[test]
    fn test_partial_write_when_full() {
        let mut fifo = BytesFifo::new(4);
        assert_eq!(fifo.write(b"abcdef"), 4);
        assert_eq!(fifo.write(b"x"), 0);
        assert_eq!(fifo.read_all(), b"abcd");
    }

    #[test]
    fn test_interleaved_stream() {
        let mut fifo = BytesFifo::new(5);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut written = 0;
        let mut output = Vec::new();
        while output.len() < payload.len() {
            written += fifo.write(&payload[written..(written + 3).min(payload.len())]);
            output.extend(fifo.read(2));
        }
        assert_eq!(output, payload);
    }
}
