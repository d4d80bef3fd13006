// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Metric Relay
//!
//! Turns semi-structured telemetry messages into flat per-instance metric rows and
//! delivers them in chunks to a remote collector.
//!
//! ## Architecture
//!
//! - [`source`]: where payloads come from (line readers, channels)
//! - [`decoder`]: JSON, CSV and regex payloads into message trees
//! - [`path`], [`formatter`], [`expr`]: field lookup, templates and arithmetic
//! - [`filter`]: inclusion and exclusion rules
//! - [`extractor`]: one message into zero or more records
//! - [`join_buffer`]: windowed join of partial records
//! - [`batch`], [`delivery`]: chunking, envelopes, retry and split policies
//! - [`pipeline`]: the tasks wiring everything together
//! - [`config`]: file and environment configuration

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_copy_implementations)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod batch;
pub mod config;
pub mod decoder;
pub mod delivery;
pub mod errors;
pub mod expr;
pub mod extractor;
pub mod filter;
pub mod formatter;
pub mod join_buffer;
pub mod path;
pub mod pipeline;
pub mod source;
pub mod timestamp;
pub mod util;

pub use config::Config;
pub use delivery::{ReqwestTransport, Transport};
pub use errors::{ConfigError, PipelineError};
pub use pipeline::{Pipeline, PipelineStats};
pub use source::{ChannelSource, LineSource, Source};
