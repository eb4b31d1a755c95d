// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! ASN.1 primitives for CMS.

Types are defined in modules named after the RFC defining them. X.509
primitives (names, algorithm identifiers, time) come from the
`x509-certificate` crate; only the CMS-specific structures live here.
*/

pub mod rfc3274;
pub mod rfc5280;
pub mod rfc5652;
