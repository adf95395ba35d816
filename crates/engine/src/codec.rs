//! Little-endian field encoding shared by log payloads and metadata files.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

pub(crate) fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    // writing into a Vec cannot fail
    let _ = buf.write_u32::<LittleEndian>(v);
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

pub(crate) fn put_str(buf: &mut Vec<u8>, v: &str) {
    put_bytes(buf, v.as_bytes());
}

pub(crate) fn put_opt_u32(buf: &mut Vec<u8>, v: Option<u32>) {
    match v {
        Some(v) => {
            put_u8(buf, 1);
            put_u32(buf, v);
        }
        None => put_u8(buf, 0),
    }
}

pub(crate) fn put_opt_bytes(buf: &mut Vec<u8>, v: Option<&[u8]>) {
    match v {
        Some(v) => {
            put_u8(buf, 1);
            put_bytes(buf, v);
        }
        None => put_u8(buf, 0),
    }
}

/// Cursor over an encoded buffer. Every read failure is corruption.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn truncated(&self) -> Error {
        Error::Corruption(format!("truncated {}", self.what))
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.buf.read_u8().map_err(|_| self.truncated())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.buf
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > self.buf.len() {
            return Err(self.truncated());
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head.to_vec())
    }

    pub fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|_| Error::Corruption(format!("invalid utf-8 in {}", self.what)))
    }

    pub fn opt_u32(&mut self) -> Result<Option<u32>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u32()?)),
            other => Err(Error::Corruption(format!(
                "invalid option tag {} in {}",
                other, self.what
            ))),
        }
    }

    pub fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.bytes()?)),
            other => Err(Error::Corruption(format!(
                "invalid option tag {} in {}",
                other, self.what
            ))),
        }
    }

    /// Fails if bytes are left over.
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Corruption(format!(
                "{} trailing bytes after {}",
                self.buf.len(),
                self.what
            )))
        }
    }
}
