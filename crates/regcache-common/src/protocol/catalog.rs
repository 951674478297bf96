use std::collections::BTreeMap;

use crate::protocol::instance::{Instance, ServiceName};

/// Service name to the tags its instances carry, across the catalog.
pub type CatalogServices = BTreeMap<ServiceName, Vec<String>>;

/// One instance as the catalog knows it, with the node it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub node: String,
    /// Instances registered without an address inherit this one
    pub node_address: String,
    pub datacenter: String,
    pub instance: Instance,
}

impl CatalogEntry {
    /// `host:port` to dial.
    pub fn endpoint(&self) -> String {
        self.instance.endpoint()
    }
}
