// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

mod cluster;
mod ids;
mod parameters;
mod ring;
mod test_cluster;

pub use cluster::*;
pub use ids::*;
pub use parameters::*;
pub use ring::*;
pub use test_cluster::*;
