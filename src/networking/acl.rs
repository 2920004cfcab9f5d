use ipnet::IpNet;
use log::warn;
use std::net::IpAddr;
use std::str::FromStr;

/// IP-level admission control for a backend. Deny entries win over allow
/// entries; an empty allow list admits everything not explicitly denied.
#[derive(Clone, Debug, Default)]
pub struct IpAcl {
    allow_list: Vec<IpNet>,
    deny_list: Vec<IpNet>,
}

impl IpAcl {
    pub fn new(allow_strs: &[String], deny_strs: &[String]) -> Self {
        IpAcl {
            allow_list: parse_cidrs(allow_strs, "allow"),
            deny_list: parse_cidrs(deny_strs, "deny"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow_list.is_empty() && self.deny_list.is_empty()
    }

    /// Returns the rejection reason, or Ok for an admitted address.
    pub fn check(&self, ip: IpAddr) -> Result<(), &'static str> {
        for net in &self.deny_list {
            if net.contains(&ip) {
                return Err("denied");
            }
        }
        if self.allow_list.is_empty() {
            return Ok(());
        }
        for net in &self.allow_list {
            if net.contains(&ip) {
                return Ok(());
            }
        }
        Err("not allowed")
    }
}

fn parse_cidrs(input: &[String], list_type: &str) -> Vec<IpNet> {
    input
        .iter()
        .filter_map(|s| {
            // Accept both CIDR "1.2.3.0/24" and plain "1.2.3.4" entries.
            match IpNet::from_str(s) {
                Ok(net) => Some(net),
                Err(_) => match s.parse::<IpAddr>() {
                    Ok(ip) => Some(IpNet::from(ip)),
                    Err(e) => {
                        warn!("Failed to parse {} list entry '{}': {}", list_type, s, e);
                        None
                    }
                },
            }
        })
        .collect()
}

/// Membership test over the string form of a client certificate subject.
///
/// An unset ACL accepts any subject (the certificate already chained to the
/// backend's client CAs by the time this runs).
pub fn subject_allowed(acl: Option<&[String]>, subject: &str) -> bool {
    match acl {
        None => true,
        Some(list) => list.iter().any(|s| s == subject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn deny_wins_over_allow() {
        let acl = IpAcl::new(&["10.0.0.0/24".to_string()], &["10.0.0.1".to_string()]);

        assert_eq!(acl.check(v4(10, 0, 0, 1)), Err("denied"));
        assert!(acl.check(v4(10, 0, 0, 2)).is_ok());
        // Not in the allow list at all.
        assert_eq!(acl.check(v4(192, 168, 1, 1)), Err("not allowed"));
    }

    #[test]
    fn empty_lists_admit_everything() {
        let acl = IpAcl::new(&[], &[]);
        assert!(acl.check(v4(1, 2, 3, 4)).is_ok());
    }

    #[test]
    fn deny_only() {
        let acl = IpAcl::new(&[], &["127.0.0.1".to_string()]);
        assert_eq!(acl.check(v4(127, 0, 0, 1)), Err("denied"));
        assert!(acl.check(v4(127, 0, 0, 2)).is_ok());
    }

    #[test]
    fn subject_membership() {
        let acl = vec!["CN=alice".to_string(), "CN=carol,O=ops".to_string()];
        assert!(subject_allowed(Some(&acl), "CN=alice"));
        assert!(!subject_allowed(Some(&acl), "CN=bob"));
        assert!(subject_allowed(None, "CN=anyone"));
    }
}
