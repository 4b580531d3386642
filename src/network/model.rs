//! Public network DTOs consumed by ContainerManager and the router

use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: Option<String>,
    pub subnet: Option<String>,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub preferred_ip: Option<Ipv4Addr>,
}
