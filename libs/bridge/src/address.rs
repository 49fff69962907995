//! Resource addresses used by upstream link targets
//!
//! Upstream clients attach to targets of the form `endpoint/tenant[/resource]`,
//! e.g. `telemetry/myTenant`. The downstream sender for such a link is opened
//! on a tenant-scoped address under the configured downstream prefix.

use crate::{BridgeError, Result};
use std::fmt;
use std::str::FromStr;

/// Separator between address segments
pub const PATH_SEPARATOR: char = '/';

/// Parsed link target address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    endpoint: String,
    tenant_id: String,
    resource_id: Option<String>,
}

impl ResourceIdentifier {
    /// Create an identifier from its parts
    pub fn new(
        endpoint: impl Into<String>,
        tenant_id: impl Into<String>,
        resource_id: Option<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        let tenant_id = tenant_id.into();

        validate_segment("endpoint", &endpoint)?;
        validate_segment("tenant", &tenant_id)?;
        if let Some(resource) = &resource_id {
            validate_segment("resource", resource)?;
        }

        Ok(Self {
            endpoint,
            tenant_id,
            resource_id,
        })
    }

    /// Parse an address of the form `endpoint/tenant[/resource]`
    pub fn parse(address: &str) -> Result<Self> {
        let mut segments = address.split(PATH_SEPARATOR);

        let endpoint = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::invalid_address(format!("'{}' has no endpoint", address)))?;
        let tenant = segments
            .next()
            .ok_or_else(|| BridgeError::invalid_address(format!("'{}' has no tenant", address)))?;
        let resource = segments.next().map(str::to_string);

        if segments.next().is_some() {
            return Err(BridgeError::invalid_address(format!(
                "'{}' has too many segments",
                address
            )));
        }

        Self::new(endpoint, tenant, resource)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    /// Address of the downstream sender serving this target's tenant
    pub fn downstream_address(&self, prefix: &str) -> String {
        format!("{}{}{}", prefix, PATH_SEPARATOR, self.tenant_id)
    }
}

fn validate_segment(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BridgeError::invalid_address(format!("{} segment is empty", name)));
    }
    if value.contains(PATH_SEPARATOR) {
        return Err(BridgeError::invalid_address(format!(
            "{} segment '{}' contains '{}'",
            name, value, PATH_SEPARATOR
        )));
    }
    Ok(())
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.endpoint, PATH_SEPARATOR, self.tenant_id)?;
        if let Some(resource) = &self.resource_id {
            write!(f, "{}{}", PATH_SEPARATOR, resource)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceIdentifier {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
