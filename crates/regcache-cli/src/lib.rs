// Copyright 2025 regcache Authors
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

//! # regcache CLI
//!
//! Command-line front end for the registry cache.
//!
//! ## Key Commands
//!
//! - `regcache serve`: register endpoints, keep them registered until a
//!   termination signal, then deregister them
//! - `regcache list`: print matching `host:port` endpoints
//! - `regcache select`: print one chosen endpoint (uniform or weighted)
//! - `regcache health`: print a service's aggregated health as JSON
//! - `regcache deregister`: remove one endpoint
//! - `regcache catalog`: query the registry catalog directly
//!
//! Registry connection settings come from `CONSUL_ADDR`, `CONSUL_TOKEN`,
//! `CONSUL_DC`, `CONSUL_ZONE` and `CONSUL_ENV`.

use anyhow::{anyhow, Result};
use regcache_common::protocol::{Instance, Metadata};
use regcache_core::InstanceQuery;

/// Parses repeated `key=value` arguments into metadata.
///
/// Later keys win. Values may contain `=`; keys may not be empty.
pub fn parse_meta<S: AsRef<str>>(pairs: &[S]) -> Result<Metadata> {
    let mut meta = Metadata::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid metadata '{}': expected key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("Invalid metadata '{}': empty key", pair));
        }
        meta.insert(key.to_string(), value.trim().to_string());
    }
    Ok(meta)
}

/// Expands a port-only address (`:9090`) with `host`; anything else is
/// returned unchanged.
pub fn resolve_address<F>(addr: &str, host: F) -> Result<String>
where
    F: FnOnce() -> Option<String>,
{
    match addr.trim().strip_prefix(':') {
        Some(port) => {
            let host = host().ok_or_else(|| {
                anyhow!("Cannot resolve '{}': no HOSTNAME and no 10.x address", addr)
            })?;
            Ok(format!("{}:{}", host, port))
        }
        None => Ok(addr.to_string()),
    }
}

/// Builds the selector query for a `-n/--zone/-t` argument set.
pub fn build_query(name: &str, zone: Option<&str>, tags: &[String]) -> InstanceQuery {
    let query = InstanceQuery::new(name).tags(tags.iter().cloned());
    match zone {
        Some(zone) => query.zone(zone),
        None => query,
    }
}

/// Filters instances of any service by zone and tags, sorted by ID.
pub fn filter_any_service<'a, I>(instances: I, zone: Option<&str>, tags: &[String]) -> Vec<Instance>
where
    I: IntoIterator<Item = &'a Instance>,
{
    let mut found: Vec<Instance> = instances
        .into_iter()
        .filter(|instance| zone.map_or(true, |zone| instance.zone() == Some(zone)))
        .filter(|instance| instance.has_tags(tags))
        .cloned()
        .collect();
    found.sort_by(|a, b| a.id.cmp(&b.id));
    found
}
