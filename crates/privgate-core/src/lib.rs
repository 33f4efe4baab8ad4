// Copyright [2026] [Privgate Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! privgate-core
//!
//! Privacy-preserving query mediation engine. Gates access to sensitive
//! datasets by:
//! - calibrating differential-privacy noise (Laplace mechanism)
//! - enforcing a per-data-source privacy budget with atomic reservation
//! - anonymizing record sets (k-anonymity, then l-diversity)
//! - mediating computation over encrypted datasets behind a pluggable
//!   scheme contract
//! - appending every privacy-relevant operation to a time-bounded audit
//!   log, failing closed when the log cannot be written

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod anonymize;
pub mod audit;
pub mod budget;
pub mod error;
pub mod gateway;
pub mod mediation;
pub mod noise;
pub mod policy;

pub use crate::error::{MediationError, MediationResult};

pub use crate::mediation::{MediationEngine, NoisedResult};
