// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bytecode instrumentation for dex and class-file containers: injection
//! targets and payloads, method-body splicing for both formats, a full dex
//! rebuild writer, and the mediator that turns registered modifications into
//! a rewritten archive next to the original.

pub mod artifact;
pub mod class_patch;
pub mod dex_patch;
pub mod dex_writer;
pub mod injection;
pub mod mediator;
