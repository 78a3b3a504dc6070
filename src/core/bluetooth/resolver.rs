//! GATT endpoint resolution
//! Picks the write and read/notify characteristics of whichever supported
//! protocol variant the peripheral exposes. Services may be reported one at
//! a time, so partial matches are accumulated across calls.

use log::{debug, info};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_CURRENT_READ_CHAR, UUID_CURRENT_SERVICE, UUID_CURRENT_WRITE_CHAR, UUID_LEGACY_READ_CHAR,
    UUID_LEGACY_SERVICE, UUID_LEGACY_WRITE_CHAR,
};
use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::types::{EndpointSet, ProtocolVariant, VariantKind};

/// Default variant table, preferred variant first
pub fn default_variants() -> Vec<ProtocolVariant> {
    vec![
        ProtocolVariant {
            kind: VariantKind::Current,
            service: UUID_CURRENT_SERVICE,
            write: UUID_CURRENT_WRITE_CHAR,
            read: UUID_CURRENT_READ_CHAR,
        },
        ProtocolVariant {
            kind: VariantKind::Legacy,
            service: UUID_LEGACY_SERVICE,
            write: UUID_LEGACY_WRITE_CHAR,
            read: UUID_LEGACY_READ_CHAR,
        },
    ]
}

#[derive(Debug, Default, Clone, Copy)]
struct Partial {
    write: bool,
    read: bool,
}

pub struct EndpointResolver {
    variants: Vec<ProtocolVariant>,
    found: Vec<Partial>,
    resolved: Option<EndpointSet>,
}

impl EndpointResolver {
    pub fn new(variants: Vec<ProtocolVariant>) -> Self {
        let found = vec![Partial::default(); variants.len()];
        Self {
            variants,
            found,
            resolved: None,
        }
    }

    /// Forget everything observed so far
    pub fn reset(&mut self) {
        self.found.iter_mut().for_each(|p| *p = Partial::default());
        self.resolved = None;
    }

    pub fn resolved(&self) -> Option<EndpointSet> {
        self.resolved
    }

    /// Feed one discovered service. Returns the endpoint set once a variant
    /// has both its write and read characteristic.
    pub fn observe(&mut self, service: Uuid, characteristics: &[Uuid]) -> Option<EndpointSet> {
        if self.resolved.is_some() {
            return self.resolved;
        }

        for (variant, partial) in self.variants.iter().zip(self.found.iter_mut()) {
            if variant.service != service {
                continue;
            }
            for characteristic in characteristics {
                if *characteristic == variant.write {
                    debug!("Found {:?} write characteristic: {}", variant.kind, characteristic);
                    partial.write = true;
                } else if *characteristic == variant.read {
                    debug!("Found {:?} read characteristic: {}", variant.kind, characteristic);
                    partial.read = true;
                }
            }
        }

        self.resolved = self
            .variants
            .iter()
            .zip(self.found.iter())
            .find(|(_, partial)| partial.write && partial.read)
            .map(|(variant, _)| EndpointSet {
                variant: variant.kind,
                write: variant.write,
                read: variant.read,
            });

        if let Some(endpoints) = self.resolved {
            info!("Resolved {:?} endpoints", endpoints.variant);
        }
        self.resolved
    }

    /// Called once discovery has completed
    pub fn finish(&self) -> Result<EndpointSet, LinkError> {
        self.resolved.ok_or(LinkError::EndpointsNotFound)
    }
}
