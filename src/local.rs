// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The owning node's own state: identity, location, published services and
//! the externally observed contact address.

use crate::{
    error::Error,
    peer::{NetworkInterface, NodeInfo, ServiceProfile, ServiceType},
};

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// The local node entity. Apart from service (de)registration, the only
/// mutation after construction is the adoption of a detected external
/// address into the contact list.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<RwLock<LocalNodeInner>>,
}

pub struct LocalNodeInner {
    info: NodeInfo,
    services: HashMap<ServiceType, ServiceProfile>,
}

impl LocalNode {
    pub fn new(info: NodeInfo) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LocalNodeInner {
                info,
                services: HashMap::new(),
            })),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LocalNodeInner> {
        self.inner.read().expect("error getting read access")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, LocalNodeInner> {
        self.inner.write().expect("error getting write access")
    }
}

impl LocalNodeInner {
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn node_id(&self) -> &str {
        self.info.id()
    }

    /// Registers a locally attached service; at most one per service type.
    pub fn register_service(&mut self, service_type: ServiceType, profile: ServiceProfile) -> Result<(), Error> {
        if self.services.contains_key(&service_type) {
            return Err(Error::InvalidState(format!(
                "service type {} is already registered",
                service_type
            )));
        }
        self.services.insert(service_type, profile);

        Ok(())
    }

    pub fn deregister_service(&mut self, service_type: ServiceType) -> Result<(), Error> {
        self.services
            .remove(&service_type)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidState(format!("service type {} is not registered", service_type)))
    }

    pub fn services(&self) -> &HashMap<ServiceType, ServiceProfile> {
        &self.services
    }

    /// Adds the externally observed address to the contact list unless an
    /// equal contact is already advertised. Returns whether it was added.
    pub fn adopt_external_address(&mut self, address: IpAddr, port: u16) -> Result<bool, Error> {
        let contact = NetworkInterface::from_ip(address, port)?;

        let contacts = self.info.profile_mut().contacts_mut();
        if contacts.contains(&contact) {
            return Ok(false);
        }

        log::info!("Detected external address {}.", contact);
        contacts.push(contact);

        Ok(true)
    }
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode")
            .field("node_id", &self.read().node_id())
            .finish()
    }
}
