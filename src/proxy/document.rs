//! Pure edits over the proxy's JSON config document.
//!
//! Routes live at `apps.http.servers.<SERVER>.routes`, TLS automation
//! policies at `apps.tls.automation.policies`. Both are keyed by exact domain
//! membership: an entry belongs to a domain when its host list (or subject
//! list) contains it.

use serde_json::{Map, Value, json};

use crate::proxy::error::{ProxyError, Result};
use crate::proxy::{DnsChallenge, ProxyRoute};

pub(crate) const SERVER: &str = "infra";

fn object_at<'a>(parent: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Map<String, Value>> {
    let slot = parent.entry(key.to_string()).or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
        .ok_or_else(|| ProxyError::invalid_document(format!("'{key}' is not an object")))
}

fn array_at<'a>(parent: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Vec<Value>> {
    let slot = parent.entry(key.to_string()).or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| ProxyError::invalid_document(format!("'{key}' is not an array")))
}

fn root(doc: &mut Value) -> Result<&mut Map<String, Value>> {
    if doc.is_null() {
        *doc = Value::Object(Map::new());
    }
    doc.as_object_mut()
        .ok_or_else(|| ProxyError::invalid_document("document root is not an object"))
}

fn routes_mut(doc: &mut Value) -> Result<&mut Vec<Value>> {
    let apps = object_at(root(doc)?, "apps")?;
    let http = object_at(apps, "http")?;
    let servers = object_at(http, "servers")?;
    let server = object_at(servers, SERVER)?;
    if !server.contains_key("listen") {
        server.insert("listen".to_string(), json!([":443", ":80"]));
    }
    array_at(server, "routes")
}

fn policies_mut(doc: &mut Value) -> Result<&mut Vec<Value>> {
    let apps = object_at(root(doc)?, "apps")?;
    let tls = object_at(apps, "tls")?;
    let automation = object_at(tls, "automation")?;
    array_at(automation, "policies")
}

fn route_hosts(route: &Value) -> impl Iterator<Item = &str> {
    route
        .get("match")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("host").and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_str)
}

fn policy_subjects(policy: &Value) -> impl Iterator<Item = &str> {
    policy
        .get("subjects")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// Route entry for `route`.
pub fn route_entry(route: &ProxyRoute) -> Value {
    json!({
        "match": [{ "host": [route.domain] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": route.upstream }],
        }],
        "terminal": true,
    })
}

/// TLS automation policy for `domain`.
pub fn tls_policy(domain: &str, dns: Option<&DnsChallenge>) -> Value {
    match dns {
        Some(dns) => json!({
            "subjects": [domain],
            "issuers": [{
                "module": "acme",
                "challenges": {
                    "dns": {
                        "provider": {
                            "name": dns.provider,
                            "gcp_project": dns.project,
                        }
                    }
                }
            }],
        }),
        None => json!({ "subjects": [domain] }),
    }
}

/// Insert or replace the route and TLS policy for `route.domain`.
pub fn upsert_route(doc: &mut Value, route: &ProxyRoute, dns: Option<&DnsChallenge>) -> Result<()> {
    strip_domain(doc, &route.domain)?;
    routes_mut(doc)?.push(route_entry(route));
    policies_mut(doc)?.push(tls_policy(&route.domain, dns));
    Ok(())
}

/// Remove the route and TLS policy for `domain`. Returns whether anything
/// was removed.
pub fn remove_route(doc: &mut Value, domain: &str) -> Result<bool> {
    strip_domain(doc, domain)
}

fn strip_domain(doc: &mut Value, domain: &str) -> Result<bool> {
    let routes = routes_mut(doc)?;
    let before = routes.len();
    routes.retain(|r| !route_hosts(r).any(|h| h == domain));
    let mut removed = routes.len() != before;

    let policies = policies_mut(doc)?;
    let before = policies.len();
    policies.retain(|p| !policy_subjects(p).any(|s| s == domain));
    removed |= policies.len() != before;

    Ok(removed)
}

/// Every reverse-proxy route in the document.
pub fn list_routes(doc: &Value) -> Vec<ProxyRoute> {
    let Some(routes) = doc
        .pointer(&format!("/apps/http/servers/{SERVER}/routes"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    routes
        .iter()
        .filter_map(|r| {
            let domain = route_hosts(r).next()?.to_string();
            let upstream = r
                .pointer("/handle/0/upstreams/0/dial")
                .and_then(Value::as_str)?
                .to_string();
            Some(ProxyRoute { domain, upstream })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn route(domain: &str, upstream: &str) -> ProxyRoute {
        ProxyRoute {
            domain: domain.to_string(),
            upstream: upstream.to_string(),
        }
    }

    #[test]
    fn test_null_document_becomes_empty() {
        let mut doc = Value::Null;
        upsert_route(&mut doc, &route("a.example.com", "127.0.0.1:10000"), None).unwrap();
        assert_eq!(
            list_routes(&doc),
            vec![route("a.example.com", "127.0.0.1:10000")]
        );
        assert_eq!(
            doc["apps"]["tls"]["automation"]["policies"],
            json!([{ "subjects": ["a.example.com"] }])
        );
    }

    #[test]
    fn test_upsert_replaces_same_domain() {
        let mut doc = json!({});
        upsert_route(&mut doc, &route("a.example.com", "127.0.0.1:10000"), None).unwrap();
        upsert_route(&mut doc, &route("b.example.com", "127.0.0.1:10001"), None).unwrap();
        upsert_route(&mut doc, &route("a.example.com", "127.0.0.1:10005"), None).unwrap();

        let routes = list_routes(&doc);
        assert_eq!(
            routes,
            vec![
                route("b.example.com", "127.0.0.1:10001"),
                route("a.example.com", "127.0.0.1:10005"),
            ]
        );
        let policies = doc["apps"]["tls"]["automation"]["policies"]
            .as_array()
            .unwrap();
        assert_eq!(policies.len(), 2);
    }

    #[test]
    fn test_dns_challenge_policy() {
        let dns = DnsChallenge {
            provider: "googleclouddns".to_string(),
            project: "acme-dns".to_string(),
        };
        let policy = tls_policy("a.example.com", Some(&dns));
        assert_eq!(
            policy,
            json!({
                "subjects": ["a.example.com"],
                "issuers": [{
                    "module": "acme",
                    "challenges": { "dns": { "provider": {
                        "name": "googleclouddns",
                        "gcp_project": "acme-dns",
                    }}}
                }]
            })
        );
    }

    #[test]
    fn test_remove_only_touches_domain() {
        let mut doc = json!({});
        upsert_route(&mut doc, &route("a.example.com", "127.0.0.1:10000"), None).unwrap();
        upsert_route(&mut doc, &route("b.example.com", "127.0.0.1:10001"), None).unwrap();

        assert!(remove_route(&mut doc, "a.example.com").unwrap());
        assert!(!remove_route(&mut doc, "a.example.com").unwrap());
        assert_eq!(list_routes(&doc), vec![route("b.example.com", "127.0.0.1:10001")]);
    }

    #[test]
    fn test_foreign_entries_preserved() {
        let mut doc = json!({
            "admin": { "listen": "0.0.0.0:2019" },
            "apps": { "http": { "servers": { "infra": {
                "listen": [":443"],
                "routes": [{ "handle": [{ "handler": "static_response", "body": "ok" }] }]
            }}}}
        });
        upsert_route(&mut doc, &route("a.example.com", "127.0.0.1:10000"), None).unwrap();
        assert_eq!(doc["admin"]["listen"], "0.0.0.0:2019");
        assert_eq!(doc["apps"]["http"]["servers"]["infra"]["listen"], json!([":443"]));
        assert_eq!(
            doc["apps"]["http"]["servers"]["infra"]["routes"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_malformed_document_rejected() {
        let mut doc = json!({ "apps": [] });
        let err = upsert_route(&mut doc, &route("a.example.com", "x:1"), None).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidDocument { .. }));
    }
}
