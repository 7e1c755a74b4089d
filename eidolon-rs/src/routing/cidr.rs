//! CIDR parsing

use ipnet::IpNet;

use crate::error::{EidolonError, Result};

/// Parse a CIDR and return it in canonical form, host bits masked off.
///
/// `10.0.0.7/24` becomes `10.0.0.0/24`. Bare addresses without a prefix are rejected.
pub fn normalize_cidr(input: &str) -> Result<String> {
    let net: IpNet = input
        .trim()
        .parse()
        .map_err(|e| EidolonError::InvalidInput(format!("Invalid CIDR '{}': {}", input, e)))?;

    Ok(net.trunc().to_string())
}
