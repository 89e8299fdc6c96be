use std::collections::BTreeMap;

use proptest::prelude::*;
use svcproxy_agent::endpoints::{EndpointsChangeTracker, EndpointsMap};
use svcproxy_agent::proxier::build_rules;
use svcproxy_agent::rules::{Action, Match};
use svcproxy_agent::service::{ServiceChangeTracker, ServicePortMap};
use svcproxy_agent::ProxierConfig;
use svcproxy_api::Protocol;
use svcproxy_networking::IpFamily;
use svcproxy_testing::{ServiceBuilder, SliceBuilder, TEST_HOSTNAME};

fn state(endpoints: usize, affinity: bool) -> (ServicePortMap, EndpointsMap, String) {
    let mut svc = ServiceBuilder::new("default", "web")
        .cluster_ip("10.96.0.20")
        .port("http", Protocol::Tcp, 80);
    if affinity {
        svc = svc.client_ip_affinity(60);
    }
    let svc = svc.build();

    let slice = (0..endpoints)
        .fold(
            SliceBuilder::new("default", "web", "web-1").port("http", Protocol::Tcp, 8080),
            |b, i| b.endpoint(&format!("10.244.{}.{}", i / 250, i % 250 + 1)),
        )
        .build();

    let st = ServiceChangeTracker::new(IpFamily::Ipv4);
    st.update(None, Some(&svc));
    let et = EndpointsChangeTracker::new(TEST_HOSTNAME, IpFamily::Ipv4);
    et.endpoint_slice_update(&slice, false);

    let mut services = ServicePortMap::new();
    services.update(&st);
    let mut eps = EndpointsMap::new();
    eps.update(&et);

    let chain = services
        .iter()
        .next()
        .map(|(_, info)| info.chains.cluster_policy.clone())
        .unwrap();
    (services, eps, chain)
}

fn config() -> ProxierConfig {
    ProxierConfig {
        hostname: TEST_HOSTNAME.to_string(),
        ..ProxierConfig::default()
    }
}

proptest! {
    #[test]
    fn test_dispatch_denominators_count_down(n in 1usize..40, affinity in any::<bool>()) {
        let (services, eps, chain) = state(n, affinity);
        let built = build_rules(&config(), &services, &eps, &BTreeMap::new());

        let dispatch: Vec<Option<usize>> = built
            .tx
            .rules_in(&chain)
            .filter(|r| !r.matches.iter().any(|m| matches!(m, Match::InAffinitySet(_))))
            .filter(|r| r.actions.iter().any(|a| matches!(a, Action::Goto(_))))
            .map(|r| r.matches.iter().find_map(|m| match m {
                Match::Random { denominator } => Some(*denominator),
                _ => None,
            }))
            .collect();

        let expected: Vec<Option<usize>> = (0..n)
            .map(|i| if i + 1 < n { Some(n - i) } else { None })
            .collect();
        prop_assert_eq!(dispatch, expected);
        prop_assert_eq!(built.endpoint_chains, n);
        prop_assert_eq!(built.active_sets.len(), if affinity { n } else { 0 });
    }

    #[test]
    fn test_generation_is_deterministic(n in 0usize..20) {
        let (services, eps, _) = state(n, false);
        let labels = BTreeMap::new();
        let a = build_rules(&config(), &services, &eps, &labels);
        let b = build_rules(&config(), &services, &eps, &labels);
        prop_assert_eq!(a, b);
    }
}
