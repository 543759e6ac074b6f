use crate::core::*;
use crate::*;
use bytes::BufMut;
use std::cell::RefCell;

/// Scratch sizes up to this many bytes live on the stack of the serialize call.
pub(crate) const STACK_SCRATCH: usize = 256;
/// Pooled buffers above this capacity are dropped instead of being kept for reuse.
const MAX_POOLED_CAPACITY: usize = 64 * 1024;
const MAX_POOL_DEPTH: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// Field header written in front of a top-level value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub tag: u8,
    pub manifest: u8,
}

/// Checked write cursor over a pre-sized output buffer.
///
/// Every write reserves its bytes first; running past the end of the buffer means the size
/// estimate undershot and is reported as `EstimateExceeded` rather than truncating.
pub struct Frame<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> Frame<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8]> {
        let start = self.offset;
        let end = start + len;
        if end > self.buf.len() {
            return Err(EncoderError::EstimateExceeded {
                estimated: self.buf.len(),
                needed: end,
            });
        }
        self.offset = end;
        Ok(&mut self.buf[start..end])
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn put_slice(&mut self, src: &[u8]) -> Result<()> {
        self.reserve(src.len())?.copy_from_slice(src);
        Ok(())
    }

    pub fn put_i16_le(&mut self, value: i16) -> Result<()> {
        let mut dst = self.reserve(2)?;
        dst.put_i16_le(value);
        Ok(())
    }

    pub fn put_u16_le(&mut self, value: u16) -> Result<()> {
        let mut dst = self.reserve(2)?;
        dst.put_u16_le(value);
        Ok(())
    }

    pub fn put_i64_le(&mut self, value: i64) -> Result<()> {
        let mut dst = self.reserve(8)?;
        dst.put_i64_le(value);
        Ok(())
    }

    pub fn put_varint32(&mut self, value: u32) -> Result<()> {
        self.put_varint64(u64::from(value))
    }

    pub fn put_varint64(&mut self, value: u64) -> Result<()> {
        let len = varint_len(value);
        encode_varint(value, self.reserve(len)?);
        Ok(())
    }

    pub(crate) fn put_header(&mut self, header: Header) -> Result<()> {
        self.put_slice(&[header.tag, header.manifest])
    }

    /// Writes a placeholder length prefix and returns its position for `end_frame`.
    pub fn begin_frame(&mut self) -> Result<usize> {
        let start = self.offset;
        self.put_i16_le(0)?;
        Ok(start)
    }

    /// Back-patches the length prefix opened at `start` with the bytes written since.
    pub fn end_frame(&mut self, start: usize) -> Result<()> {
        let len = self.offset - start - LENGTH_PREFIX;
        let prefix = i16::try_from(len).map_err(|_| EncoderError::FrameTooLarge(len))?;
        let mut dst = &mut self.buf[start..start + LENGTH_PREFIX];
        dst.put_i16_le(prefix);
        Ok(())
    }
}

/// Runs `f` over a zeroed scratch buffer of exactly `len` bytes.
///
/// The buffer is released when this returns, on the error path as well; nothing written into
/// it can outlive the call.
pub(crate) fn with_scratch<R>(len: usize, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
    if len <= STACK_SCRATCH {
        let mut buf = [0u8; STACK_SCRATCH];
        return f(&mut buf[..len]);
    }
    let mut lease = Lease::take(len);
    f(&mut lease.buf[..len])
}

struct Lease {
    buf: Vec<u8>,
}

impl Lease {
    fn take(len: usize) -> Self {
        let mut buf = POOL
            .try_with(|pool| pool.borrow_mut().pop())
            .ok()
            .flatten()
            .unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        Self { buf }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let buf = std::mem::take(&mut self.buf);
        // the pool may already be gone during thread teardown
        let _ = POOL.try_with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < MAX_POOL_DEPTH {
                pool.push(buf);
            }
        });
    }
}
