//! Ingress base-URL resolution

use k8s_openapi::api::networking::v1::Ingress;
use std::collections::HashMap;

/// Externally reachable location of one service, flattened from ingress rules
#[derive(Clone, Debug, PartialEq)]
pub struct IngressTarget {
    pub host: String,
    pub port: Option<i32>,
    pub path: String,
}

/// Flatten a namespace's ingress rules into a service-name -> target map.
/// When several rules point at the same backend service the last one wins.
pub fn ingress_targets(ingresses: &[Ingress]) -> HashMap<String, IngressTarget> {
    let mut targets = HashMap::new();
    for ingress in ingresses {
        let rules = ingress.spec.as_ref().and_then(|spec| spec.rules.as_ref());
        for rule in rules.into_iter().flatten() {
            let host = rule.host.clone().unwrap_or_default();
            let paths = rule.http.as_ref().map(|http| http.paths.as_slice()).unwrap_or(&[]);
            for path in paths {
                if let Some(backend) = &path.backend.service {
                    targets.insert(
                        backend.name.clone(),
                        IngressTarget {
                            host: host.clone(),
                            port: backend.port.as_ref().and_then(|port| port.number),
                            path: path.path.clone().unwrap_or_default(),
                        },
                    );
                }
            }
        }
    }
    targets
}

/// Build the externally visible base URL for a target. The scheme is https
/// when the backend port is one of the configured TLS ports.
pub fn ingress_base_url(target: &IngressTarget, tls_ports: &[i32]) -> String {
    let https = target.port.map(|port| tls_ports.contains(&port)).unwrap_or(false);
    let scheme = if https { "https" } else { "http" };
    format!("{}://{}{}", scheme, target.host, target.path)
}
