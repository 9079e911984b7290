//! Docker-link style environment variables for services

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

/// Namespace holding the API server's own service
pub const MASTER_SERVICE_NAMESPACE: &str = "default";
/// Services whose variables every pod gets
pub const MASTER_SERVICES: &[&str] = &["kubernetes"];

fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()?
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

fn env_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

/// Pick the services whose variables a pod in `namespace` receives
///
/// Master services are always included; services in the pod's own namespace
/// only when `enable_service_links` is set. A same-named service in the
/// pod's namespace wins over a master service.
pub fn visible_services<'a>(
    services: &'a [Service],
    namespace: &str,
    enable_service_links: bool,
) -> Vec<&'a Service> {
    let mut picked: BTreeMap<&str, &Service> = BTreeMap::new();
    for service in services {
        if cluster_ip(service).is_none() {
            continue;
        }
        let name = service.metadata.name.as_deref().unwrap_or_default();
        let ns = service.metadata.namespace.as_deref().unwrap_or_default();
        if ns == MASTER_SERVICE_NAMESPACE && MASTER_SERVICES.contains(&name) {
            picked.entry(name).or_insert(service);
        } else if ns == namespace && enable_service_links {
            picked.insert(name, service);
        }
    }
    picked.into_values().collect()
}

/// Variables describing `services`, in order
pub fn service_env(services: &[&Service]) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for service in services {
        let Some(ip) = cluster_ip(service) else {
            continue;
        };
        let prefix = env_name(service.metadata.name.as_deref().unwrap_or_default());
        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();

        vars.push((format!("{}_SERVICE_HOST", prefix), ip.to_string()));
        if let Some(first) = ports.first() {
            vars.push((format!("{}_SERVICE_PORT", prefix), first.port.to_string()));
        }
        for port in ports {
            if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
                vars.push((
                    format!("{}_SERVICE_PORT_{}", prefix, env_name(name)),
                    port.port.to_string(),
                ));
            }
        }

        let host = if ip.contains(':') {
            format!("[{}]", ip)
        } else {
            ip.to_string()
        };
        for (i, port) in ports.iter().enumerate() {
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            let url = format!("{}://{}:{}", protocol.to_lowercase(), host, port.port);
            if i == 0 {
                vars.push((format!("{}_PORT", prefix), url.clone()));
            }
            let port_prefix = format!("{}_PORT_{}_{}", prefix, port.port, protocol.to_uppercase());
            vars.push((port_prefix.clone(), url));
            vars.push((format!("{}_PROTO", port_prefix), protocol.to_lowercase()));
            vars.push((format!("{}_PORT", port_prefix), port.port.to_string()));
            vars.push((format!("{}_ADDR", port_prefix), ip.to_string()));
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn service(ns: &str, name: &str, ip: &str, ports: &[(Option<&str>, i32)]) -> Service {
        let mut svc = Service::default();
        svc.metadata.namespace = Some(ns.to_string());
        svc.metadata.name = Some(name.to_string());
        svc.spec = Some(ServiceSpec {
            cluster_ip: Some(ip.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| ServicePort {
                        name: name.map(str::to_string),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        svc
    }

    fn lookup<'a>(vars: &'a [(String, String)], name: &str) -> Option<&'a str> {
        vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_service_link_variables() {
        let svc = service("default", "my-db", "10.0.0.5", &[(Some("sql"), 5432), (None, 9187)]);
        let vars = service_env(&[&svc]);

        assert_eq!(lookup(&vars, "MY_DB_SERVICE_HOST"), Some("10.0.0.5"));
        assert_eq!(lookup(&vars, "MY_DB_SERVICE_PORT"), Some("5432"));
        assert_eq!(lookup(&vars, "MY_DB_SERVICE_PORT_SQL"), Some("5432"));
        assert_eq!(lookup(&vars, "MY_DB_PORT"), Some("tcp://10.0.0.5:5432"));
        assert_eq!(lookup(&vars, "MY_DB_PORT_9187_TCP"), Some("tcp://10.0.0.5:9187"));
        assert_eq!(lookup(&vars, "MY_DB_PORT_9187_TCP_PROTO"), Some("tcp"));
        assert_eq!(lookup(&vars, "MY_DB_PORT_5432_TCP_PORT"), Some("5432"));
        assert_eq!(lookup(&vars, "MY_DB_PORT_5432_TCP_ADDR"), Some("10.0.0.5"));
    }

    #[test]
    fn test_headless_services_are_skipped() {
        let svc = service("default", "headless", "None", &[(None, 80)]);
        assert!(service_env(&[&svc]).is_empty());
    }

    #[test]
    fn test_master_service_always_visible() {
        let services = vec![
            service("default", "kubernetes", "10.0.0.1", &[(Some("https"), 443)]),
            service("apps", "web", "10.0.0.9", &[(None, 80)]),
            service("other", "db", "10.0.0.7", &[(None, 5432)]),
        ];

        let names = |picked: Vec<&Service>| -> Vec<String> {
            picked
                .iter()
                .map(|s| s.metadata.name.clone().unwrap_or_default())
                .collect()
        };
        assert_eq!(names(visible_services(&services, "apps", true)), vec!["kubernetes", "web"]);
        assert_eq!(names(visible_services(&services, "apps", false)), vec!["kubernetes"]);
    }
}
