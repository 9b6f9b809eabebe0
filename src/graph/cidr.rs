//! IPv4 CIDR parsing and deterministic subnet allocation.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::ConfigError;

/// An IPv4 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    base: u32,
    prefix: u8,
}

impl Cidr {
    /// Creates a block, masking off host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is longer than 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ConfigError> {
        if prefix > 32 {
            return Err(ConfigError::InvalidCidr {
                cidr: format!("{addr}/{prefix}"),
            });
        }
        Ok(Self {
            base: u32::from(addr) & mask(prefix),
            prefix,
        })
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix(self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    #[must_use]
    pub const fn size(self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    fn end(self) -> u64 {
        u64::from(self.base) + self.size()
    }

    /// Returns true if `other` lies entirely inside this block.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        other.prefix >= self.prefix && u64::from(other.base) >= u64::from(self.base) && other.end() <= self.end()
    }

    /// Returns true if the two blocks share any address.
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        u64::from(self.base) < other.end() && u64::from(other.base) < self.end()
    }
}

const fn mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidCidr { cidr: s.to_string() };
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let cidr = Self::new(addr, prefix).map_err(|_| invalid())?;
        if u32::from(addr) != cidr.base {
            return Err(invalid());
        }
        Ok(cidr)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

/// A subnet's address request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidrRequest {
    /// A fixed block.
    Fixed(Cidr),
    /// Any aligned block with this prefix length.
    Sized(u8),
}

/// Carves subnet blocks out of a network.
///
/// Fixed blocks are reserved first. A sized request keeps the block named
/// for it in `existing` when that block still has the requested prefix and
/// is free; every other existing block stays reserved. The remaining sized
/// requests are then placed largest first (ties by name) at the lowest
/// aligned free address, so a fresh allocation only depends on the set of
/// requests and a grown schema never moves a block that is already in use.
///
/// # Errors
///
/// Returns an error if a block falls outside the network, two fixed blocks
/// overlap, or the network has no room left.
pub fn allocate(
    network: Cidr,
    requests: &[(String, CidrRequest)],
    existing: &BTreeMap<String, Cidr>,
) -> Result<Vec<(String, Cidr)>, ConfigError> {
    let mut taken: Vec<Cidr> = Vec::new();
    let mut out = Vec::with_capacity(requests.len());

    for (name, request) in requests {
        if let CidrRequest::Fixed(block) = request {
            if !network.contains(*block) {
                return Err(ConfigError::SubnetAllocation {
                    message: format!("subnet '{name}' block {block} is outside network {network}"),
                });
            }
            if let Some(clash) = taken.iter().find(|t| t.overlaps(*block)) {
                return Err(ConfigError::SubnetAllocation {
                    message: format!("subnet '{name}' block {block} overlaps {clash}"),
                });
            }
            taken.push(*block);
            out.push((name.clone(), *block));
        }
    }

    let mut sized: Vec<(&String, u8)> = Vec::new();
    for (name, request) in requests {
        let CidrRequest::Sized(prefix) = *request else {
            continue;
        };
        match existing.get(name) {
            Some(block)
                if block.prefix() == prefix
                    && network.contains(*block)
                    && !taken.iter().any(|t| t.overlaps(*block)) =>
            {
                taken.push(*block);
                out.push((name.clone(), *block));
            }
            _ => sized.push((name, prefix)),
        }
    }
    // Blocks still held by subnets the schema no longer names.
    for (name, block) in existing {
        if !requests.iter().any(|(n, _)| n == name) && network.contains(*block) {
            taken.push(*block);
        }
    }
    sized.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    for (name, prefix) in sized {
        if prefix < network.prefix() || prefix > 32 {
            return Err(ConfigError::SubnetAllocation {
                message: format!("subnet '{name}' size /{prefix} does not fit network {network}"),
            });
        }
        let block = first_free(network, prefix, &taken).ok_or_else(|| ConfigError::SubnetAllocation {
            message: format!("no free /{prefix} block left in {network} for subnet '{name}'"),
        })?;
        taken.push(block);
        out.push((name.clone(), block));
    }

    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn first_free(network: Cidr, prefix: u8, taken: &[Cidr]) -> Option<Cidr> {
    let step = 1u64 << (32 - prefix);
    let mut cursor = u64::from(network.base);
    while cursor + step <= network.end() {
        let candidate = Cidr {
            base: u32::try_from(cursor).ok()?,
            prefix,
        };
        match taken.iter().filter(|t| t.overlaps(candidate)).map(|t| t.end()).max() {
            None => return Some(candidate),
            Some(end) => {
                // Jump past the clash, then realign.
                cursor = end.div_ceil(step) * step;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(cidr("10.0.0.0/16").to_string(), "10.0.0.0/16");
        assert!("10.0.0.1/16".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("banana".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let net = cidr("10.0.0.0/16");
        assert!(net.contains(cidr("10.0.4.0/24")));
        assert!(!net.contains(cidr("10.1.0.0/24")));
        assert!(cidr("10.0.0.0/23").overlaps(cidr("10.0.1.0/24")));
        assert!(!cidr("10.0.0.0/24").overlaps(cidr("10.0.1.0/24")));
    }

    #[test]
    fn test_allocation_is_largest_first_and_deterministic() {
        let requests = vec![
            ("b".to_string(), CidrRequest::Sized(24)),
            ("a".to_string(), CidrRequest::Sized(24)),
            ("big".to_string(), CidrRequest::Sized(20)),
        ];
        let out = allocate(cidr("10.0.0.0/16"), &requests, &BTreeMap::new()).unwrap();
        assert_eq!(
            out,
            vec![
                ("a".to_string(), cidr("10.0.16.0/24")),
                ("b".to_string(), cidr("10.0.17.0/24")),
                ("big".to_string(), cidr("10.0.0.0/20")),
            ]
        );

        let mut reversed = requests;
        reversed.reverse();
        assert_eq!(allocate(cidr("10.0.0.0/16"), &reversed, &BTreeMap::new()).unwrap(), out);
    }

    #[test]
    fn test_allocation_skips_fixed_blocks() {
        let requests = vec![
            ("fixed".to_string(), CidrRequest::Fixed(cidr("10.0.0.0/24"))),
            ("sized".to_string(), CidrRequest::Sized(23)),
        ];
        let out = allocate(cidr("10.0.0.0/16"), &requests, &BTreeMap::new()).unwrap();
        assert_eq!(out[1], ("sized".to_string(), cidr("10.0.2.0/23")));
    }

    #[test]
    fn test_allocation_exhaustion() {
        let requests = vec![
            ("a".to_string(), CidrRequest::Sized(25)),
            ("b".to_string(), CidrRequest::Sized(25)),
            ("c".to_string(), CidrRequest::Sized(25)),
        ];
        assert!(allocate(cidr("10.0.0.0/24"), &requests, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_existing_blocks_stay_put() {
        let existing = BTreeMap::from([("web".to_string(), cidr("10.0.0.0/24"))]);
        let requests = vec![
            ("app".to_string(), CidrRequest::Sized(24)),
            ("web".to_string(), CidrRequest::Sized(24)),
        ];
        let out = allocate(cidr("10.0.0.0/16"), &requests, &existing).unwrap();
        assert_eq!(
            out,
            vec![
                ("app".to_string(), cidr("10.0.1.0/24")),
                ("web".to_string(), cidr("10.0.0.0/24")),
            ]
        );
    }

    #[test]
    fn test_resized_subnet_is_reallocated() {
        let existing = BTreeMap::from([
            ("web".to_string(), cidr("10.0.0.0/24")),
            ("old".to_string(), cidr("10.0.1.0/24")),
        ]);
        let requests = vec![("web".to_string(), CidrRequest::Sized(23))];
        let out = allocate(cidr("10.0.0.0/16"), &requests, &existing).unwrap();
        assert_eq!(out, vec![("web".to_string(), cidr("10.0.2.0/23"))]);
    }
}
