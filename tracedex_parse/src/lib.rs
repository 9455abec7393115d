// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! This module provides functions to extract archives and parse dex and class
//! files, the context graph used for cross-container symbol resolution, the
//! frozen reference cache, and the analysis session driving odex preparation.
pub mod classfile;
pub mod context;
pub mod dex;
pub mod extraction;
pub mod references;
pub mod session;
