// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! tracedex reads Android DEX/APK containers and JVM class files into one
//! reflective class model, resolves symbols across composable class contexts,
//! and injects tracing instrumentation into method bodies, writing the result
//! back out as a valid JAR/APK.

#[cfg(feature = "macros")]
pub use tracedex_macros;
#[cfg(feature = "models")]
pub use tracedex_models;
#[cfg(feature = "parse")]
pub use tracedex_parse;
#[cfg(feature = "inject")]
pub use tracedex_inject;
