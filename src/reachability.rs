//! Reachability Classifier: fuses the Interface Inventory and the STUN
//! Prober's result into a single human-readable grade.

use serde::{Deserialize, Serialize};

use crate::iface::InterfaceSummary;
use crate::stun::{NatFamily, StunResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn label(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

/// Pure function: global IPv6 beats global IPv4 beats CGNAT beats NAT
/// family beats bare external-address observation beats mere interface
/// presence.
pub fn grade(ifaces: &InterfaceSummary, stun: Option<&StunResult>) -> Grade {
    if ifaces.has_global_ipv6() {
        return Grade::A;
    }
    if ifaces.has_global_ipv4() {
        return Grade::B;
    }
    if let Some(stun) = stun {
        if stun.cgnat {
            return Grade::D;
        }
        match stun.nat_family {
            NatFamily::None | NatFamily::FullCone | NatFamily::AddressRestricted => {
                return Grade::B
            }
            NatFamily::PortRestricted => return Grade::C,
            NatFamily::Symmetric => return Grade::D,
            NatFamily::Unknown => {}
        }
        if !stun.external_addrs.is_empty() {
            return Grade::C;
        }
    }
    if !ifaces.is_empty() {
        return Grade::D;
    }
    Grade::F
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::ServerProbeOutcome;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::time::SystemTime;

    fn ifaces_with(v4: Vec<Ipv4Addr>, v6: Vec<Ipv6Addr>) -> InterfaceSummary {
        InterfaceSummary {
            interfaces: Vec::new(),
            global_v4: v4,
            global_v6: v6,
        }
    }

    fn stun_with(nat_family: NatFamily, cgnat: bool, external: Vec<SocketAddr>) -> StunResult {
        StunResult {
            outcomes: vec![ServerProbeOutcome {
                server: "s1".into(),
                observed: external.first().copied(),
            }],
            nat_family,
            external_addrs: external,
            cgnat,
            probed_at: SystemTime::now(),
        }
    }

    #[test]
    fn global_ipv6_present_grades_a_regardless_of_stun() {
        let ifaces = ifaces_with(vec![], vec!["2001:db8::1".parse().unwrap()]);
        assert_eq!(grade(&ifaces, None), Grade::A);
    }

    #[test]
    fn only_global_ipv4_grades_b() {
        let ifaces = ifaces_with(vec![Ipv4Addr::new(8, 8, 8, 8)], vec![]);
        let stun = stun_with(NatFamily::Symmetric, false, vec![]);
        assert_eq!(grade(&ifaces, Some(&stun)), Grade::B);
    }

    #[test]
    fn empty_ifaces_and_no_stun_grades_f() {
        let ifaces = ifaces_with(vec![], vec![]);
        assert_eq!(grade(&ifaces, None), Grade::F);
    }

    #[test]
    fn cgnat_caps_at_d_regardless_of_nat_family() {
        let ifaces = ifaces_with(vec![], vec![]);
        let stun = stun_with(NatFamily::None, true, vec![]);
        assert_eq!(grade(&ifaces, Some(&stun)), Grade::D);
    }

    #[test]
    fn port_restricted_grades_c() {
        let ifaces = ifaces_with(vec![], vec![]);
        let stun = stun_with(NatFamily::PortRestricted, false, vec![]);
        assert_eq!(grade(&ifaces, Some(&stun)), Grade::C);
    }

    #[test]
    fn unknown_nat_family_with_external_addrs_grades_c() {
        let ifaces = ifaces_with(vec![], vec![]);
        let stun = stun_with(
            NatFamily::Unknown,
            false,
            vec!["203.0.113.1:1".parse().unwrap()],
        );
        assert_eq!(grade(&ifaces, Some(&stun)), Grade::C);
    }
}
