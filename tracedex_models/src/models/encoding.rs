// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::{Read, Seek, Write};

use super::FormatError;

/// Little-endian decoding as used by the dex format. Structures implement
/// `from_bytes` with explicit field reads; `read_leb128` covers the
/// variable-width values of class data and encoded items.
pub trait Decode: Sized {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError>;

    fn read_leb128<R: Read + Seek>(byte_view: &mut R) -> Result<(usize, u64), FormatError> {
        let value = leb128::read::unsigned(byte_view)
            .map_err(|e| FormatError::corrupt(format!("bad uleb128: {}", e)))?;
        let mut tmp = [0u8; 10];
        let width = leb128::write::unsigned(&mut tmp.as_mut(), value)
            .map_err(|e| FormatError::corrupt(format!("uleb128 width: {}", e)))?;
        Ok((width, value))
    }

    fn read_sleb128<R: Read + Seek>(byte_view: &mut R) -> Result<(usize, i64), FormatError> {
        let value = leb128::read::signed(byte_view)
            .map_err(|e| FormatError::corrupt(format!("bad sleb128: {}", e)))?;
        let mut tmp = [0u8; 10];
        let width = leb128::write::signed(&mut tmp.as_mut(), value)
            .map_err(|e| FormatError::corrupt(format!("sleb128 width: {}", e)))?;
        Ok((width, value))
    }
}

/// Little-endian encoding, the write side of `Decode`. Returns the number of
/// bytes written so section emitters can track offsets.
pub trait Encode {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError>;

    fn write_leb128<W: Write>(writer: &mut W, value: u64) -> Result<usize, FormatError> {
        leb128::write::unsigned(writer, value)
            .map_err(|e| FormatError::corrupt(format!("uleb128 write: {}", e)))
    }

    fn write_sleb128<W: Write>(writer: &mut W, value: i64) -> Result<usize, FormatError> {
        leb128::write::signed(writer, value)
            .map_err(|e| FormatError::corrupt(format!("sleb128 write: {}", e)))
    }
}

macro_rules! impl_decode_le {
    ($ty:ty) => {
        impl Decode for $ty {
            fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                byte_view.read_exact(&mut bytes)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
        impl Encode for $ty {
            fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
                let bytes = self.to_le_bytes();
                writer.write_all(&bytes)?;
                Ok(bytes.len())
            }
        }
    };
}

impl_decode_le!(u8);
impl_decode_le!(u16);
impl_decode_le!(u32);
impl_decode_le!(u64);
impl_decode_le!(i8);
impl_decode_le!(i16);
impl_decode_le!(i32);
impl_decode_le!(i64);

/// Big-endian reads for the JVM class-file format. Kept as free functions
/// since class files only need a handful of scalar widths.
pub fn read_u8<R: Read>(r: &mut R) -> Result<u8, FormatError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn read_u16_be<R: Read>(r: &mut R) -> Result<u16, FormatError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

pub fn read_u32_be<R: Read>(r: &mut R) -> Result<u32, FormatError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

pub fn read_exact_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>, FormatError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<(), FormatError> {
    w.write_all(&[v])?;
    Ok(())
}

pub fn write_u16_be<W: Write>(w: &mut W, v: u16) -> Result<(), FormatError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn write_u32_be<W: Write>(w: &mut W, v: u32) -> Result<(), FormatError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}
