// Copyright 2025 hasql Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # hasql CLI
//!
//! Command-line driver for hasql clusters.
//!
//! The `hasql simulate` command builds a cluster over in-memory backends,
//! injects the requested faults, runs a write/read workload through the
//! fan-out proxies and prints a JSON report: call outcomes, final
//! membership, metrics and every cluster event.
//!
//! ## Key Commands
//!
//! - `hasql simulate`: run a workload against a simulated cluster
//! - `hasql balancers`: list the available balancer policies

pub mod simulate;
