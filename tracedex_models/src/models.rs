// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! All models shared between the readers and the injection engine: the
//! format-agnostic class model, the dex structures, the JVM class-file
//! structures, the instruction enum and the `Decode`/`Encode` traits.

mod android;
pub use android::*;

mod class;
pub use class::*;

mod dex;
pub use dex::*;

mod encoding;
pub use encoding::*;

mod instruction;
pub use instruction::*;

mod jvm;
pub use jvm::*;

mod resources;
pub use resources::*;

mod types;
pub use types::*;

/// Errors raised while decoding or re-encoding a binary container. Corruption
/// is fatal for the single class or method being parsed; I/O failures are
/// fatal for the whole read and carried through unchanged.
#[derive(Debug)]
pub enum FormatError {
    Io(std::io::Error),
    NotAClassFile,
    NotADexFile,
    Corrupt(String),
}

impl FormatError {
    pub fn corrupt<S: Into<String>>(detail: S) -> Self {
        FormatError::Corrupt(detail.into())
    }

    pub fn is_io(&self) -> bool {
        matches!(self, FormatError::Io(_))
    }
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::Io(e) => write!(f, "i/o error: {}", e),
            FormatError::NotAClassFile => write!(f, "Not a class file"),
            FormatError::NotADexFile => write!(f, "Not a dex file"),
            FormatError::Corrupt(detail) => write!(f, "corrupt input: {}", detail),
        }
    }
}

impl std::error::Error for FormatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormatError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FormatError {
    fn from(e: std::io::Error) -> Self {
        FormatError::Io(e)
    }
}
